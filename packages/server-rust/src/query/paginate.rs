//! Offset/limit pagination over an ordered match set.

use gatebroker_core::BrokerError;

/// A validated page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    offset: usize,
    /// `None` returns everything after `offset`.
    limit: Option<usize>,
}

impl Page {
    /// Validates raw request values. A limit of zero or less means "the rest".
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` for a negative offset.
    pub fn new(offset: i64, limit: i64) -> Result<Self, BrokerError> {
        let offset = usize::try_from(offset).map_err(|_| {
            BrokerError::InvalidArgument(format!("offset must not be negative, got {offset}"))
        })?;
        let limit = if limit > 0 {
            Some(usize::try_from(limit).unwrap_or(usize::MAX))
        } else {
            None
        };
        Ok(Self { offset, limit })
    }

    /// Slices `matched`, returning the page and the pre-pagination total.
    #[must_use]
    pub fn apply<T>(&self, matched: Vec<T>) -> (Vec<T>, u64) {
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        (page, total)
    }
}

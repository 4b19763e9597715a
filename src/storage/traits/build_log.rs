//! Build audit log trait.

use crate::Result;
use crate::models::BuildRecord;

/// Sink for index build records.
///
/// Records are for operators; nothing in the check path reads them.
pub trait BuildLog: Send + Sync {
    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored.
    fn record_build(&self, record: &BuildRecord) -> Result<()>;

    /// Returns the most recent record for `index_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    fn last_build(&self, index_type: &str) -> Result<Option<BuildRecord>>;
}

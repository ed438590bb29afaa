//! Checkpoint file holding the orders produced so far.
//!
//! Plain UTF-8 text, records joined with [`SEPARATOR`]. The whole file is
//! rewritten after every accepted order, so an interrupted write can only
//! lose the newest record.
//!
//! The number of stored orders is used to skip that many leading messages on
//! resume. Rejected messages leave no trace here, so this is an approximation
//! of where the previous run stopped, not an index into the batch.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::HarvestError;
use crate::formatter::FormattedOrder;

/// Marker line between two records.
pub const SEPARATOR_MARKER: &str = "=== PEDIDO SEPARADOR ===";

/// What an order containing [`SEPARATOR_MARKER`] gets rewritten to.
pub const ESCAPED_MARKER: &str = "=== PEDIDO-SEPARADOR ===";

/// Record separator as written to disk.
pub const SEPARATOR: &str = "\n=== PEDIDO SEPARADOR ===\n";

/// File-backed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored orders. A missing file is an empty checkpoint.
    pub fn load(&self) -> Result<Vec<FormattedOrder>, HarvestError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint file");
                return Ok(Vec::new());
            }
            Err(e) => return Err(HarvestError::Checkpoint(e)),
        };

        let orders: Vec<FormattedOrder> = contents
            .split(SEPARATOR)
            .filter_map(FormattedOrder::new)
            .collect();
        info!(path = %self.path.display(), orders = orders.len(), "checkpoint loaded");
        Ok(orders)
    }

    /// Replace the file with `orders`.
    pub fn save(&self, orders: &[FormattedOrder]) -> Result<(), HarvestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = orders
            .iter()
            .map(FormattedOrder::as_str)
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        fs::write(&self.path, body)?;
        debug!(path = %self.path.display(), orders = orders.len(), "checkpoint saved");
        Ok(())
    }
}

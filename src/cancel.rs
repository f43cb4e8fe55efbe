use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{DiffusionError, Result};

/// Cooperative cancellation flag shared between a caller and a running diffusion.
///
/// Clones observe the same flag. The diffusion loop checks it at the top of every
/// timestep, so a cancelled run stops before its next inference call.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DiffusionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();

        assert!(token.check().is_ok());
        other.cancel();

        assert!(token.is_cancelled());
        assert!(token.check().unwrap_err().is_cancelled());
    }
}

//! NAT translation lookup
//!
//! The conntrack collaborator sits behind [`TranslationSource`]. A missing
//! translation is `Ok(None)`, never an error.

use crate::connection::{ConnectionKey, IPTranslation};
use async_trait::async_trait;
use thiserror::Error;

/// Translation lookup errors
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("Translation source unavailable: {0}")]
    Unavailable(String),
}

pub type TranslationResult<T> = Result<T, TranslationError>;

/// Source of NAT translations for connections
#[async_trait]
pub trait TranslationSource: Send + Sync {
    /// Source name, used in logs
    fn name(&self) -> &str;

    /// Look up the translation for a connection
    async fn lookup_translation(
        &self,
        key: &ConnectionKey,
    ) -> TranslationResult<Option<IPTranslation>>;

    /// Number of translations currently known
    fn len(&self) -> usize {
        0
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

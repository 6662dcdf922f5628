use thiserror::Error;

/// Failures that stop (or skip part of) one mapping file.
///
/// Only `TranslationMissing` is recoverable: the affected entry is skipped with a
/// warning and the rest of the file proceeds. Everything else is fatal for the
/// mapping file that raised it, but never for the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("no wiki label translation for {key} (category {category_id})")]
    TranslationMissing { category_id: String, key: String },

    #[error("section \"{section}\" not usable: {reason}")]
    SectionNotFound { section: String, reason: String },

    #[error("section \"{section}\" is missing declared rows: {}", labels.join(", "))]
    MissingDeclaredRow { section: String, labels: Vec<String> },

    #[error("rows in section \"{section}\" declared more than once with different queries: {label}")]
    MappingConflict { section: String, label: String },

    #[error("leaderboard fetch failed for {game_id}/{category_id}: {message}")]
    ExternalFetchFailure {
        game_id: String,
        category_id: String,
        message: String,
    },

    #[error("save rejected for {title}: {message}")]
    SaveRejected { title: String, message: String },
}

impl SyncError {
    pub fn section_not_found(section: &str, reason: impl Into<String>) -> Self {
        Self::SectionNotFound {
            section: section.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether processing of the surrounding mapping file may continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TranslationMissing { .. })
    }
}

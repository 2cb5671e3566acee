use dispatch_common::{Error, Result};
use dispatch_config::SlugConfig;
use rusqlite::{Connection, params};
use tracing::debug;

/// Fallback when a candidate contains no usable characters.
const EMPTY_SLUG: &str = "untitled";

/// A table whose rows carry a unique `slug` column.
pub trait SlugScope {
    const TABLE: &'static str;
}

/// Produces slugs that are unused within a [`SlugScope`].
#[derive(Debug, Clone, Copy)]
pub struct SlugGenerator {
    max_attempts: u32,
    max_length: usize,
}

impl Default for SlugGenerator {
    fn default() -> Self {
        Self::from(SlugConfig::default())
    }
}

impl From<SlugConfig> for SlugGenerator {
    fn from(config: SlugConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_length: config.max_length.max(1),
        }
    }
}

impl SlugGenerator {
    /// Return `slugify(candidate)` or the first free `base-N` (N >= 2).
    ///
    /// Lookups run on `conn`, so callers holding a transaction see their own
    /// uncommitted rows. The row identified by `exclude_id` never counts as a
    /// collision.
    pub fn generate<S: SlugScope>(
        &self,
        conn: &Connection,
        candidate: &str,
        exclude_id: Option<&str>,
    ) -> Result<String> {
        let base = slugify(candidate, self.max_length);
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE slug = ?1 AND (?2 IS NULL OR id != ?2))",
            S::TABLE
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(format!("failed to prepare slug lookup: {e}")))?;

        for attempt in 1..=self.max_attempts {
            let slug = if attempt == 1 {
                base.clone()
            } else {
                with_suffix(&base, attempt, self.max_length)
            };

            let taken: bool = stmt
                .query_row(params![slug, exclude_id], |row| row.get(0))
                .map_err(|e| Error::Database(format!("failed to check slug: {e}")))?;
            if !taken {
                return Ok(slug);
            }
            debug!("slug '{slug}' already used in {}", S::TABLE);
        }

        Err(Error::Conflict(format!(
            "no free slug for '{base}' in {} after {} attempts",
            S::TABLE,
            self.max_attempts
        )))
    }
}

/// Transliterate to ASCII, then keep lowercase alphanumerics joined by
/// single dashes.
pub fn slugify(input: &str, max_length: usize) -> String {
    let ascii = deunicode::deunicode(input);
    let mut slug = String::with_capacity(ascii.len());
    let mut pending_dash = false;

    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    let slug = truncate(&slug, max_length);
    if slug.is_empty() {
        EMPTY_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

fn with_suffix(base: &str, attempt: u32, max_length: usize) -> String {
    let suffix = format!("-{attempt}");
    let room = max_length.saturating_sub(suffix.len());
    format!("{}{suffix}", truncate(base, room))
}

// Slugs are ASCII, so byte slicing is safe.
fn truncate(slug: &str, max_length: usize) -> &str {
    let cut = &slug[..slug.len().min(max_length)];
    cut.trim_end_matches('-')
}

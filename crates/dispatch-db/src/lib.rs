pub mod database;
pub mod member;
pub mod migrations;
pub mod newsletter;
pub mod settings;
pub mod slug;
mod timestamp;

pub use database::{Database, with_transaction};
pub use member::Member;
pub use migrations::{AppliedMigration, Migration, Migrator, SqlMigration};
pub use newsletter::{NewNewsletter, Newsletter, NewsletterPatch, NewsletterStatus, Visibility};
pub use slug::{SlugGenerator, SlugScope};

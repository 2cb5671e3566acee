use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dispatch_common::{Error, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::{with_transaction, write_error};
use crate::slug::{SlugGenerator, SlugScope};
use crate::timestamp;

/// Listing order shared by every newsletter query. The trailing `id` makes it
/// a total order, so pages never shuffle between requests.
pub const DEFAULT_ORDER: &str = "sort_order ASC, created_at ASC, id ASC";

/// Maximum pivot rows per `INSERT` statement (3 bound values each).
const PIVOT_CHUNK_ROWS: usize = 300;

const COLUMNS: &str = "id, name, description, slug, sender_name, sender_email, sender_reply_to, \
     status, visibility, subscribe_on_signup, sort_order, header_image, show_header_icon, \
     show_header_title, show_header_name, title_font_category, title_alignment, \
     show_feature_image, body_font_category, footer_content, show_badge, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsletterStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Members,
    Paid,
}

/// A named, ordered communication channel members can subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Newsletter {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub slug: String,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub sender_reply_to: String,
    pub status: NewsletterStatus,
    pub visibility: Visibility,
    pub subscribe_on_signup: bool,
    pub sort_order: i64,
    pub header_image: Option<String>,
    pub show_header_icon: bool,
    pub show_header_title: bool,
    pub show_header_name: bool,
    pub title_font_category: String,
    pub title_alignment: String,
    pub show_feature_image: bool,
    pub body_font_category: String,
    pub footer_content: Option<String>,
    pub show_badge: bool,
    pub created_at: DateTime<Utc>,
}

impl SlugScope for Newsletter {
    const TABLE: &'static str = "newsletters";
}

impl Newsletter {
    /// A fresh record carrying the model defaults. The slug is left empty and
    /// gets derived from the name on save.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            slug: String::new(),
            sender_name: None,
            sender_email: None,
            sender_reply_to: "newsletter".to_string(),
            status: NewsletterStatus::Active,
            visibility: Visibility::Members,
            subscribe_on_signup: true,
            sort_order: 0,
            header_image: None,
            show_header_icon: true,
            show_header_title: true,
            show_header_name: true,
            title_font_category: "sans_serif".to_string(),
            title_alignment: "center".to_string(),
            show_feature_image: true,
            body_font_category: "sans_serif".to_string(),
            footer_content: None,
            show_badge: true,
            created_at: timestamp::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NewsletterStatus::Active
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            slug: row.get(3)?,
            sender_name: row.get(4)?,
            sender_email: row.get(5)?,
            sender_reply_to: row.get(6)?,
            status: row.get(7)?,
            visibility: row.get(8)?,
            subscribe_on_signup: row.get(9)?,
            sort_order: row.get(10)?,
            header_image: row.get(11)?,
            show_header_icon: row.get(12)?,
            show_header_title: row.get(13)?,
            show_header_name: row.get(14)?,
            title_font_category: row.get(15)?,
            title_alignment: row.get(16)?,
            show_feature_image: row.get(17)?,
            body_font_category: row.get(18)?,
            footer_content: row.get(19)?,
            show_badge: row.get(20)?,
            created_at: timestamp::column(row, 21)?,
        })
    }
}

/// Input for [`create`]. Unset fields take the model defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewNewsletter {
    pub name: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub sender_reply_to: Option<String>,
    pub status: Option<NewsletterStatus>,
    pub visibility: Option<Visibility>,
    pub subscribe_on_signup: Option<bool>,
    pub header_image: Option<String>,
    pub show_header_icon: Option<bool>,
    pub show_header_title: Option<bool>,
    pub show_header_name: Option<bool>,
    pub title_font_category: Option<String>,
    pub title_alignment: Option<String>,
    pub show_feature_image: Option<bool>,
    pub body_font_category: Option<String>,
    pub footer_content: Option<String>,
    pub show_badge: Option<bool>,
}

impl NewNewsletter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn into_newsletter(self) -> Newsletter {
        let base = Newsletter::new(self.name);
        Newsletter {
            slug: self.slug.unwrap_or_default(),
            description: self.description,
            sender_name: self.sender_name,
            sender_email: self.sender_email,
            sender_reply_to: self.sender_reply_to.unwrap_or(base.sender_reply_to),
            status: self.status.unwrap_or(base.status),
            visibility: self.visibility.unwrap_or(base.visibility),
            subscribe_on_signup: self.subscribe_on_signup.unwrap_or(base.subscribe_on_signup),
            header_image: self.header_image,
            show_header_icon: self.show_header_icon.unwrap_or(base.show_header_icon),
            show_header_title: self.show_header_title.unwrap_or(base.show_header_title),
            show_header_name: self.show_header_name.unwrap_or(base.show_header_name),
            title_font_category: self.title_font_category.unwrap_or(base.title_font_category),
            title_alignment: self.title_alignment.unwrap_or(base.title_alignment),
            show_feature_image: self.show_feature_image.unwrap_or(base.show_feature_image),
            body_font_category: self.body_font_category.unwrap_or(base.body_font_category),
            footer_content: self.footer_content,
            show_badge: self.show_badge.unwrap_or(base.show_badge),
            ..base
        }
    }
}

/// Changes for [`update`]. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsletterPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub sender_reply_to: Option<String>,
    pub status: Option<NewsletterStatus>,
    pub visibility: Option<Visibility>,
    pub subscribe_on_signup: Option<bool>,
    pub sort_order: Option<i64>,
    pub header_image: Option<String>,
    pub show_header_icon: Option<bool>,
    pub show_header_title: Option<bool>,
    pub show_header_name: Option<bool>,
    pub title_font_category: Option<String>,
    pub title_alignment: Option<String>,
    pub show_feature_image: Option<bool>,
    pub body_font_category: Option<String>,
    pub footer_content: Option<String>,
    pub show_badge: Option<bool>,
}

impl NewsletterPatch {
    fn apply(self, current: Newsletter) -> Newsletter {
        Newsletter {
            name: self.name.unwrap_or(current.name),
            slug: self.slug.unwrap_or(current.slug),
            description: self.description.or(current.description),
            sender_name: self.sender_name.or(current.sender_name),
            sender_email: self.sender_email.or(current.sender_email),
            sender_reply_to: self.sender_reply_to.unwrap_or(current.sender_reply_to),
            status: self.status.unwrap_or(current.status),
            visibility: self.visibility.unwrap_or(current.visibility),
            subscribe_on_signup: self.subscribe_on_signup.unwrap_or(current.subscribe_on_signup),
            sort_order: self.sort_order.unwrap_or(current.sort_order),
            header_image: self.header_image.or(current.header_image),
            show_header_icon: self.show_header_icon.unwrap_or(current.show_header_icon),
            show_header_title: self.show_header_title.unwrap_or(current.show_header_title),
            show_header_name: self.show_header_name.unwrap_or(current.show_header_name),
            title_font_category: self.title_font_category.unwrap_or(current.title_font_category),
            title_alignment: self.title_alignment.unwrap_or(current.title_alignment),
            show_feature_image: self.show_feature_image.unwrap_or(current.show_feature_image),
            body_font_category: self.body_font_category.unwrap_or(current.body_font_category),
            footer_content: self.footer_content.or(current.footer_content),
            show_badge: self.show_badge.unwrap_or(current.show_badge),
            ..current
        }
    }
}

/// Create a newsletter: normalise name and slug, place it after the last
/// active newsletter, then insert. Archived newsletters keep `sort_order` 0.
pub fn create(conn: &Connection, slugs: &SlugGenerator, input: NewNewsletter) -> Result<Newsletter> {
    with_transaction(conn, |tx| {
        let mut newsletter = input.into_newsletter();

        normalize(tx, slugs, &mut newsletter, None)?;
        validate(&newsletter)?;

        if newsletter.is_active() {
            newsletter.sort_order = next_available_sort_order(tx)?;
        }

        insert(tx, &newsletter)?;
        info!(
            "created newsletter {} ({}) at sort_order {}",
            newsletter.id, newsletter.slug, newsletter.sort_order
        );
        Ok(newsletter)
    })
}

/// Apply `patch` to the stored newsletter. The slug is regenerated only when
/// the patch changes it or the stored one is empty.
///
/// An archived newsletter that becomes active goes last unless the patch
/// names a position. An explicit position held by another active newsletter
/// is a `Conflict`.
pub fn update(
    conn: &Connection,
    slugs: &SlugGenerator,
    id: &str,
    patch: NewsletterPatch,
) -> Result<Newsletter> {
    with_transaction(conn, |tx| {
        let current = find_by_id(tx, id)?
            .ok_or_else(|| Error::NotFound(format!("newsletter {id}")))?;
        let previous_slug = current.slug.clone();
        let was_active = current.is_active();
        let explicit_sort_order = patch.sort_order;
        let mut newsletter = patch.apply(current);

        normalize(tx, slugs, &mut newsletter, Some(&previous_slug))?;
        validate(&newsletter)?;

        if newsletter.is_active() {
            match explicit_sort_order {
                Some(sort_order) => {
                    if sort_order_taken(tx, sort_order, &newsletter.id)? {
                        return Err(Error::Conflict(format!(
                            "sort_order {sort_order} is already used by an active newsletter"
                        )));
                    }
                }
                None if !was_active => newsletter.sort_order = next_available_sort_order(tx)?,
                None => {}
            }
        }

        tx.execute(
            "UPDATE newsletters SET
                name = ?2, description = ?3, slug = ?4, sender_name = ?5, sender_email = ?6,
                sender_reply_to = ?7, status = ?8, visibility = ?9, subscribe_on_signup = ?10,
                sort_order = ?11, header_image = ?12, show_header_icon = ?13,
                show_header_title = ?14, show_header_name = ?15, title_font_category = ?16,
                title_alignment = ?17, show_feature_image = ?18, body_font_category = ?19,
                footer_content = ?20, show_badge = ?21
             WHERE id = ?1",
            params![
                newsletter.id,
                newsletter.name,
                newsletter.description,
                newsletter.slug,
                newsletter.sender_name,
                newsletter.sender_email,
                newsletter.sender_reply_to,
                newsletter.status,
                newsletter.visibility,
                newsletter.subscribe_on_signup,
                newsletter.sort_order,
                newsletter.header_image,
                newsletter.show_header_icon,
                newsletter.show_header_title,
                newsletter.show_header_name,
                newsletter.title_font_category,
                newsletter.title_alignment,
                newsletter.show_feature_image,
                newsletter.body_font_category,
                newsletter.footer_content,
                newsletter.show_badge,
            ],
        )
        .map_err(|e| write_error("failed to update newsletter", e))?;

        debug!("updated newsletter {}", newsletter.id);
        Ok(newsletter)
    })
}

/// Save-time normalisation: trim the name, then derive a unique slug from
/// the explicit slug or the name when the slug changed or is empty.
fn normalize(
    conn: &Connection,
    slugs: &SlugGenerator,
    newsletter: &mut Newsletter,
    previous_slug: Option<&str>,
) -> Result<()> {
    let trimmed = newsletter.name.trim();
    if trimmed.len() != newsletter.name.len() {
        newsletter.name = trimmed.to_string();
    }

    let slug_changed = previous_slug != Some(newsletter.slug.as_str());
    if slug_changed || newsletter.slug.is_empty() {
        let candidate = if newsletter.slug.is_empty() {
            newsletter.name.clone()
        } else {
            newsletter.slug.clone()
        };

        if !candidate.is_empty() {
            newsletter.slug =
                slugs.generate::<Newsletter>(conn, &candidate, Some(newsletter.id.as_str()))?;
        }
    }
    Ok(())
}

fn validate(newsletter: &Newsletter) -> Result<()> {
    if newsletter.name.is_empty() {
        return Err(Error::Validation("newsletter name is required".into()));
    }
    if newsletter.sort_order < 0 {
        return Err(Error::Validation(format!(
            "sort_order must be non-negative, got {}",
            newsletter.sort_order
        )));
    }
    Ok(())
}

/// Insert `newsletter` exactly as given, without normalisation.
pub fn insert(conn: &Connection, newsletter: &Newsletter) -> Result<()> {
    let sql = format!(
        "INSERT INTO newsletters ({COLUMNS}) VALUES
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
    );
    conn.execute(
        &sql,
        params![
            newsletter.id,
            newsletter.name,
            newsletter.description,
            newsletter.slug,
            newsletter.sender_name,
            newsletter.sender_email,
            newsletter.sender_reply_to,
            newsletter.status,
            newsletter.visibility,
            newsletter.subscribe_on_signup,
            newsletter.sort_order,
            newsletter.header_image,
            newsletter.show_header_icon,
            newsletter.show_header_title,
            newsletter.show_header_name,
            newsletter.title_font_category,
            newsletter.title_alignment,
            newsletter.show_feature_image,
            newsletter.body_font_category,
            newsletter.footer_content,
            newsletter.show_badge,
            timestamp::format(&newsletter.created_at),
        ],
    )
    .map_err(|e| write_error("failed to insert newsletter", e))?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Newsletter>> {
    find_one(conn, "id", id)
}

pub fn find_by_slug(conn: &Connection, slug: &str) -> Result<Option<Newsletter>> {
    find_one(conn, "slug", slug)
}

fn find_one(conn: &Connection, column: &str, value: &str) -> Result<Option<Newsletter>> {
    let sql = format!("SELECT {COLUMNS} FROM newsletters WHERE {column} = ?1");
    conn.query_row(&sql, params![value], Newsletter::from_row)
        .optional()
        .map_err(|e| Error::Database(format!("failed to load newsletter: {e}")))
}

/// All newsletters, optionally filtered by status, in [`DEFAULT_ORDER`].
pub fn list(conn: &Connection, status: Option<NewsletterStatus>) -> Result<Vec<Newsletter>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM newsletters
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY {DEFAULT_ORDER}"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map(params![status], Newsletter::from_row)
        .map_err(|e| Error::Database(format!("failed to query newsletters: {e}")))?;

    let mut newsletters = Vec::new();
    for row in rows {
        newsletters.push(
            row.map_err(|e| Error::Database(format!("failed to read newsletter row: {e}")))?,
        );
    }
    Ok(newsletters)
}

pub fn count(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM newsletters", [], |row| row.get(0))
        .map_err(|e| Error::Database(format!("failed to count newsletters: {e}")))?;
    Ok(count as usize)
}

/// Remove every newsletter. Subscriptions go with them.
pub fn delete_all(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM newsletters", [])
        .map_err(|e| Error::Database(format!("failed to delete newsletters: {e}")))
}

/// One past the highest `sort_order` among active newsletters, or 0 if there
/// are none.
///
/// This is a plain read. Two writers that each compute a value before either
/// inserts will get the same number; running it in the same transaction as
/// the insert only narrows that window.
pub fn next_available_sort_order(conn: &Connection) -> Result<i64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT sort_order FROM newsletters WHERE status = ?1
             ORDER BY sort_order DESC LIMIT 1",
            params![NewsletterStatus::Active],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read last sort_order: {e}")))?;

    match last {
        None => Ok(0),
        Some(sort_order) => sort_order.checked_add(1).ok_or_else(|| {
            Error::Conflict(format!("no sort_order left after {sort_order}"))
        }),
    }
}

fn sort_order_taken(conn: &Connection, sort_order: i64, exclude_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM newsletters
                       WHERE status = ?1 AND sort_order = ?2 AND id != ?3)",
        params![NewsletterStatus::Active, sort_order, exclude_id],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to check sort_order: {e}")))
}

/// Subscribe `member_ids` to the newsletter by inserting one pivot row each.
///
/// All rows land or none do: the batch runs in the caller's transaction when
/// there is one, otherwise in its own. Existing subscriptions are not
/// skipped, so a repeat fails with `Conflict`.
pub fn subscribe_members_by_id<S: AsRef<str>>(
    conn: &Connection,
    newsletter_id: &str,
    member_ids: &[S],
) -> Result<usize> {
    if member_ids.is_empty() {
        return Ok(0);
    }

    with_transaction(conn, |tx| {
        let mut inserted = 0;
        for chunk in member_ids.chunks(PIVOT_CHUNK_ROWS) {
            let rows: Vec<(String, &str)> = chunk
                .iter()
                .map(|member_id| (Uuid::new_v4().to_string(), member_id.as_ref()))
                .collect();

            let values = vec!["(?, ?, ?)"; rows.len()].join(", ");
            let sql = format!(
                "INSERT INTO members_newsletters (id, member_id, newsletter_id) VALUES {values}"
            );
            inserted += tx
                .execute(
                    &sql,
                    params_from_iter(
                        rows.iter()
                            .flat_map(|(id, member_id)| [id.as_str(), *member_id, newsletter_id]),
                    ),
                )
                .map_err(|e| write_error("failed to subscribe members", e))?;
        }

        info!("subscribed {inserted} member(s) to newsletter {newsletter_id}");
        Ok(inserted)
    })
}

/// Ids of members subscribed to the newsletter, in subscription order.
pub fn member_ids(conn: &Connection, newsletter_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT member_id FROM members_newsletters
             WHERE newsletter_id = ?1
             ORDER BY rowid",
        )
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map(params![newsletter_id], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Database(format!("failed to query subscriptions: {e}")))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(|e| Error::Database(format!("failed to read subscription row: {e}")))?);
    }
    Ok(ids)
}

impl NewsletterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsletterStatus::Active => "active",
            NewsletterStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for NewsletterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NewsletterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(NewsletterStatus::Active),
            "archived" => Ok(NewsletterStatus::Archived),
            other => Err(Error::Validation(format!("unknown newsletter status: {other}"))),
        }
    }
}

impl ToSql for NewsletterStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for NewsletterStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Members => "members",
            Visibility::Paid => "paid",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "members" => Ok(Visibility::Members),
            "paid" => Ok(Visibility::Paid),
            other => Err(Error::Validation(format!("unknown newsletter visibility: {other}"))),
        }
    }
}

impl ToSql for Visibility {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Visibility {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, member};
    use chrono::TimeZone;

    fn create_named(conn: &Connection, name: &str) -> Newsletter {
        create(conn, &SlugGenerator::default(), NewNewsletter::named(name)).unwrap()
    }

    #[test]
    fn create_applies_model_defaults() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        newsletter_table_empty(&conn);

        let newsletter = create_named(&conn, "Weekly");
        assert_eq!(newsletter.slug, "weekly");
        assert_eq!(newsletter.sender_reply_to, "newsletter");
        assert_eq!(newsletter.status, NewsletterStatus::Active);
        assert_eq!(newsletter.visibility, Visibility::Members);
        assert!(newsletter.subscribe_on_signup);
        assert!(newsletter.show_header_name);
        assert_eq!(newsletter.title_font_category, "sans_serif");
        assert_eq!(newsletter.title_alignment, "center");

        let stored = find_by_id(&conn, &newsletter.id).unwrap().unwrap();
        assert_eq!(stored, newsletter);
    }

    #[test]
    fn duplicate_names_get_distinct_slugs_and_trimmed_names() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        newsletter_table_empty(&conn);

        let first = create_named(&conn, "A");
        let second = create_named(&conn, "A");
        let third = create_named(&conn, "A ");

        assert_eq!(first.slug, "a");
        assert_eq!(second.slug, "a-2");
        assert_eq!(third.slug, "a-3");
        assert_eq!(third.name, "A");
        assert_eq!(find_by_id(&conn, &third.id).unwrap().unwrap().name, "A");
    }

    #[test]
    fn explicit_slug_is_slugified_and_deduplicated() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();

        let mut input = NewNewsletter::named("Product updates");
        input.slug = Some("Default Newsletter".to_string());
        let newsletter = create(&conn, &SlugGenerator::default(), input).unwrap();

        // the seeded default already owns `default-newsletter`
        assert_eq!(newsletter.slug, "default-newsletter-2");
    }

    #[test]
    fn blank_name_is_a_validation_error() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let before = count(&conn).unwrap();

        let err = create(&conn, &SlugGenerator::default(), NewNewsletter::named("   ")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(count(&conn).unwrap(), before);
    }

    #[test]
    fn update_keeps_slug_when_only_name_changes() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");

        let patch = NewsletterPatch {
            name: Some("  Weekly Roundup ".to_string()),
            ..NewsletterPatch::default()
        };
        let updated = update(&conn, &SlugGenerator::default(), &newsletter.id, patch).unwrap();
        assert_eq!(updated.name, "Weekly Roundup");
        assert_eq!(updated.slug, "weekly");
    }

    #[test]
    fn update_regenerates_changed_slug_against_other_rows() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        create_named(&conn, "Weekly");
        let monthly = create_named(&conn, "Monthly");

        let patch = NewsletterPatch {
            slug: Some("Weekly".to_string()),
            ..NewsletterPatch::default()
        };
        let updated = update(&conn, &SlugGenerator::default(), &monthly.id, patch).unwrap();
        assert_eq!(updated.slug, "weekly-2");

        let same = NewsletterPatch {
            slug: Some("weekly-2".to_string()),
            ..NewsletterPatch::default()
        };
        let unchanged = update(&conn, &SlugGenerator::default(), &monthly.id, same).unwrap();
        assert_eq!(unchanged.slug, "weekly-2");
    }

    #[test]
    fn update_missing_newsletter_is_not_found() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let err = update(
            &conn,
            &SlugGenerator::default(),
            "missing",
            NewsletterPatch::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn sort_order_starts_at_zero_and_ignores_archived() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        newsletter_table_empty(&conn);
        assert_eq!(next_available_sort_order(&conn).unwrap(), 0);

        let mut archived = Newsletter::new("Old");
        archived.slug = "old".to_string();
        archived.status = NewsletterStatus::Archived;
        archived.sort_order = 10;
        insert(&conn, &archived).unwrap();
        assert_eq!(next_available_sort_order(&conn).unwrap(), 0);

        let first = create_named(&conn, "First");
        assert_eq!(first.sort_order, 0);
        assert_eq!(next_available_sort_order(&conn).unwrap(), 1);

        let second = create_named(&conn, "Second");
        assert_eq!(second.sort_order, 1);
    }

    #[test]
    fn exhausted_sort_order_is_a_conflict_not_an_overflow() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let mut last = Newsletter::new("Last");
        last.slug = "last".to_string();
        last.sort_order = i64::MAX;
        insert(&conn, &last).unwrap();

        assert!(next_available_sort_order(&conn).unwrap_err().is_conflict());

        let before = count(&conn).unwrap();
        let err = create(&conn, &SlugGenerator::default(), NewNewsletter::named("Next")).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(count(&conn).unwrap(), before);
    }

    #[test]
    fn active_sort_orders_stay_unique() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let weekly = create_named(&conn, "Weekly");
        let monthly = create_named(&conn, "Monthly");
        assert_eq!((weekly.sort_order, monthly.sort_order), (1, 2));

        // moving onto the seeded default's position is refused
        let patch = NewsletterPatch {
            sort_order: Some(0),
            ..NewsletterPatch::default()
        };
        let err = update(&conn, &SlugGenerator::default(), &monthly.id, patch).unwrap_err();
        assert!(err.is_conflict());

        // a free position is fine, as is keeping its own
        for sort_order in [7, 7] {
            let patch = NewsletterPatch {
                sort_order: Some(sort_order),
                ..NewsletterPatch::default()
            };
            let moved = update(&conn, &SlugGenerator::default(), &monthly.id, patch).unwrap();
            assert_eq!(moved.sort_order, 7);
        }

        let mut orders: Vec<i64> = list(&conn, Some(NewsletterStatus::Active))
            .unwrap()
            .iter()
            .map(|n| n.sort_order)
            .collect();
        let total = orders.len();
        orders.dedup();
        assert_eq!(orders.len(), total);
    }

    #[test]
    fn unarchived_newsletter_goes_last() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let mut input = NewNewsletter::named("Old");
        input.status = Some(NewsletterStatus::Archived);
        let archived = create(&conn, &SlugGenerator::default(), input).unwrap();
        assert_eq!(archived.sort_order, 0);
        create_named(&conn, "Weekly");

        let patch = NewsletterPatch {
            status: Some(NewsletterStatus::Active),
            ..NewsletterPatch::default()
        };
        let revived = update(&conn, &SlugGenerator::default(), &archived.id, patch).unwrap();
        assert_eq!(revived.sort_order, 2);
    }

    #[test]
    fn unreadable_created_at_fails_the_listing() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        conn.execute("UPDATE newsletters SET created_at = 'sometime'", [])
            .unwrap();

        let err = list(&conn, None).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[test]
    fn list_uses_compound_default_order() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        newsletter_table_empty(&conn);

        let t1 = Utc.with_ymd_and_hms(2022, 4, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2022, 4, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2022, 4, 3, 0, 0, 0).unwrap();

        for (slug, sort_order, created_at) in [("first", 1, t2), ("second", 0, t1), ("third", 0, t3)] {
            let mut newsletter = Newsletter::new(slug);
            newsletter.slug = slug.to_string();
            newsletter.sort_order = sort_order;
            newsletter.created_at = created_at;
            insert(&conn, &newsletter).unwrap();
        }

        let slugs: Vec<String> = list(&conn, None).unwrap().into_iter().map(|n| n.slug).collect();
        assert_eq!(slugs, vec!["second", "third", "first"]);
    }

    #[test]
    fn list_filters_by_status() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();

        let mut archived = NewNewsletter::named("Old");
        archived.status = Some(NewsletterStatus::Archived);
        create(&conn, &SlugGenerator::default(), archived).unwrap();

        let archived = list(&conn, Some(NewsletterStatus::Archived)).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].slug, "old");
        assert!(list(&conn, Some(NewsletterStatus::Active))
            .unwrap()
            .iter()
            .all(Newsletter::is_active));
    }

    #[test]
    fn subscribe_inserts_one_pivot_row_per_member() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");
        let members: Vec<String> = ["m1@example.com", "m2@example.com", "m3@example.com"]
            .iter()
            .map(|email| member::create(&conn, email, None).unwrap().id)
            .collect();

        let inserted = subscribe_members_by_id(&conn, &newsletter.id, &members).unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(member_ids(&conn, &newsletter.id).unwrap(), members);

        let pivot_ids: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT id) FROM members_newsletters WHERE newsletter_id = ?1",
                params![newsletter.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(pivot_ids, 3);
    }

    #[test]
    fn resubscribing_is_a_conflict_and_inserts_nothing() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");
        let m1 = member::create(&conn, "m1@example.com", None).unwrap();
        let m2 = member::create(&conn, "m2@example.com", None).unwrap();
        subscribe_members_by_id(&conn, &newsletter.id, &[m1.id.as_str()]).unwrap();

        let err = subscribe_members_by_id(&conn, &newsletter.id, &[m2.id.as_str(), m1.id.as_str()])
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(member_ids(&conn, &newsletter.id).unwrap(), vec![m1.id]);
    }

    #[test]
    fn subscribe_joins_caller_transaction() {
        let db = Database::in_memory().unwrap();
        let mut conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");
        let m1 = member::create(&conn, "m1@example.com", None).unwrap();

        {
            let tx = conn.transaction().unwrap();
            subscribe_members_by_id(&tx, &newsletter.id, &[m1.id.as_str()]).unwrap();
            // rolled back on drop
        }

        assert!(member_ids(&conn, &newsletter.id).unwrap().is_empty());
    }

    #[test]
    fn subscribe_spans_multiple_chunks() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");
        let members: Vec<String> = (0..PIVOT_CHUNK_ROWS + 5)
            .map(|i| member::create(&conn, &format!("m{i}@example.com"), None).unwrap().id)
            .collect();

        let inserted = subscribe_members_by_id(&conn, &newsletter.id, &members).unwrap();
        assert_eq!(inserted, PIVOT_CHUNK_ROWS + 5);
    }

    #[test]
    fn subscribing_unknown_member_is_rejected() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let newsletter = create_named(&conn, "Weekly");

        let err = subscribe_members_by_id(&conn, &newsletter.id, &["ghost-member"]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn booleans_are_stored_as_integers() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let mut input = NewNewsletter::named("Flags");
        input.show_badge = Some(false);
        let newsletter = create(&conn, &SlugGenerator::default(), input).unwrap();

        let (kind, value): (String, i64) = conn
            .query_row(
                "SELECT typeof(show_badge), show_badge FROM newsletters WHERE id = ?1",
                params![newsletter.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(kind, "integer");
        assert_eq!(value, 0);
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!("archived".parse::<NewsletterStatus>().unwrap(), NewsletterStatus::Archived);
        assert!("deleted".parse::<NewsletterStatus>().is_err());
        assert_eq!(Visibility::Paid.to_string(), "paid");
    }

    fn newsletter_table_empty(conn: &Connection) {
        delete_all(conn).unwrap();
    }
}

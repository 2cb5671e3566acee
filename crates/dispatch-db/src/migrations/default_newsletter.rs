use dispatch_common::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use super::Migration;
use crate::newsletter::{self, Newsletter};
use crate::settings;

/// Newsletter field a legacy setting is copied into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Name,
    Description,
    BodyFontCategory,
    FooterContent,
    HeaderImage,
    ShowBadge,
    ShowFeatureImage,
    ShowHeaderIcon,
    ShowHeaderTitle,
    TitleAlignment,
    TitleFontCategory,
}

/// Legacy site settings read by the seed. `newsletter_show_header_name` is
/// deliberately absent so that field keeps the seed value.
const LEGACY_SETTINGS: &[(&str, Target)] = &[
    ("title", Target::Name),
    ("description", Target::Description),
    ("newsletter_body_font_category", Target::BodyFontCategory),
    ("newsletter_footer_content", Target::FooterContent),
    ("newsletter_header_image", Target::HeaderImage),
    ("newsletter_show_badge", Target::ShowBadge),
    ("newsletter_show_feature_image", Target::ShowFeatureImage),
    ("newsletter_show_header_icon", Target::ShowHeaderIcon),
    ("newsletter_show_header_title", Target::ShowHeaderTitle),
    ("newsletter_title_alignment", Target::TitleAlignment),
    ("newsletter_title_font_category", Target::TitleFontCategory),
];

impl Target {
    fn for_key(key: &str) -> Option<Self> {
        LEGACY_SETTINGS
            .iter()
            .find(|(legacy, _)| *legacy == key)
            .map(|(_, target)| *target)
    }

    /// Copy `value` onto `newsletter`. Flags are true only for the exact
    /// string `"true"`; text is copied verbatim, and a NULL leaves a
    /// non-nullable text field at its seed value.
    fn apply(self, newsletter: Newsletter, value: Option<String>) -> Newsletter {
        let flag = value.as_deref() == Some("true");
        match self {
            Target::Name => Newsletter {
                name: value.unwrap_or(newsletter.name),
                ..newsletter
            },
            Target::Description => Newsletter {
                description: value,
                ..newsletter
            },
            Target::BodyFontCategory => Newsletter {
                body_font_category: value.unwrap_or(newsletter.body_font_category),
                ..newsletter
            },
            Target::FooterContent => Newsletter {
                footer_content: value,
                ..newsletter
            },
            Target::HeaderImage => Newsletter {
                header_image: value,
                ..newsletter
            },
            Target::ShowBadge => Newsletter {
                show_badge: flag,
                ..newsletter
            },
            Target::ShowFeatureImage => Newsletter {
                show_feature_image: flag,
                ..newsletter
            },
            Target::ShowHeaderIcon => Newsletter {
                show_header_icon: flag,
                ..newsletter
            },
            Target::ShowHeaderTitle => Newsletter {
                show_header_title: flag,
                ..newsletter
            },
            Target::TitleAlignment => Newsletter {
                title_alignment: value.unwrap_or(newsletter.title_alignment),
                ..newsletter
            },
            Target::TitleFontCategory => Newsletter {
                title_font_category: value.unwrap_or(newsletter.title_font_category),
                ..newsletter
            },
        }
    }
}

/// The record seeded when no newsletter exists yet.
fn seed_record() -> Newsletter {
    Newsletter {
        description: Some(String::new()),
        slug: "default-newsletter".to_string(),
        footer_content: Some(String::new()),
        show_header_name: false,
        ..Newsletter::new("Ghost")
    }
}

/// Fold legacy settings onto `base`. Keys outside the legacy set are ignored.
pub fn merge_settings(
    base: Newsletter,
    settings: impl IntoIterator<Item = (String, Option<String>)>,
) -> Newsletter {
    settings.into_iter().fold(base, |newsletter, (key, value)| {
        match Target::for_key(&key) {
            Some(target) => target.apply(newsletter, value),
            None => newsletter,
        }
    })
}

/// Seeds one default newsletter from the legacy site settings.
///
/// `up` is a no-op when any newsletter already exists. `down` deletes every
/// newsletter, not only the seeded one.
pub struct DefaultNewsletter;

impl Migration for DefaultNewsletter {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "add_default_newsletter"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        let existing = newsletter::count(conn)?;
        if existing != 0 {
            warn!("skipping default newsletter: {existing} newsletter(s) already exist");
            return Ok(());
        }

        let keys: Vec<&str> = LEGACY_SETTINGS.iter().map(|(key, _)| *key).collect();
        let legacy = settings::get_many(conn, &keys)?;
        let default = merge_settings(seed_record(), legacy);

        info!("adding the default newsletter '{}'", default.name);
        newsletter::insert(conn, &default)
    }

    fn down(&self, conn: &Connection) -> Result<()> {
        let removed = newsletter::delete_all(conn)?;
        info!("removed {removed} newsletter(s)");
        Ok(())
    }
}

use super::SqlMigration;

pub const CREATE_NEWSLETTER_TABLES: SqlMigration = SqlMigration {
    version: 1,
    name: "create_newsletter_tables",
    up: "CREATE TABLE settings (
            id TEXT PRIMARY KEY,
            key TEXT NOT NULL UNIQUE,
            value TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE newsletters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            slug TEXT NOT NULL UNIQUE,
            sender_name TEXT,
            sender_email TEXT,
            sender_reply_to TEXT NOT NULL DEFAULT 'newsletter',
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'archived')),
            visibility TEXT NOT NULL DEFAULT 'members'
                CHECK (visibility IN ('members', 'paid')),
            subscribe_on_signup INTEGER NOT NULL DEFAULT 1 CHECK (subscribe_on_signup IN (0, 1)),
            sort_order INTEGER NOT NULL DEFAULT 0 CHECK (sort_order >= 0),
            header_image TEXT,
            show_header_icon INTEGER NOT NULL DEFAULT 1 CHECK (show_header_icon IN (0, 1)),
            show_header_title INTEGER NOT NULL DEFAULT 1 CHECK (show_header_title IN (0, 1)),
            show_header_name INTEGER NOT NULL DEFAULT 1 CHECK (show_header_name IN (0, 1)),
            title_font_category TEXT NOT NULL DEFAULT 'sans_serif',
            title_alignment TEXT NOT NULL DEFAULT 'center',
            show_feature_image INTEGER NOT NULL DEFAULT 1 CHECK (show_feature_image IN (0, 1)),
            body_font_category TEXT NOT NULL DEFAULT 'sans_serif',
            footer_content TEXT,
            show_badge INTEGER NOT NULL DEFAULT 1 CHECK (show_badge IN (0, 1)),
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_newsletters_status_sort ON newsletters(status, sort_order);

        CREATE TABLE members (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE members_newsletters (
            id TEXT PRIMARY KEY,
            member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
            newsletter_id TEXT NOT NULL REFERENCES newsletters(id) ON DELETE CASCADE,
            UNIQUE (member_id, newsletter_id)
        );

        CREATE INDEX idx_members_newsletters_newsletter
            ON members_newsletters(newsletter_id);",
    down: "DROP TABLE IF EXISTS members_newsletters;
        DROP TABLE IF EXISTS members;
        DROP TABLE IF EXISTS newsletters;
        DROP TABLE IF EXISTS settings;",
};

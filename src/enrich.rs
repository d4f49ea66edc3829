//! Derived fields extracted from normalized records.
//!
//! Every extractor is total: a field that cannot be derived is left empty,
//! so enrichment never drops a row the parser accepted.

use regex::Regex;
use std::sync::LazyLock;

use crate::parse::NormalizedRecord;

/// Output column names, in export order.
pub const COLUMNS: [&str; 20] = [
    "user_id",
    "id",
    "subseq_id",
    "message",
    "audit_time",
    "action_raw",
    "type",
    "label",
    "version",
    "recipe_id",
    "recipe_name",
    "material_name",
    "material_id",
    "name1",
    "name2",
    "username",
    "action_derived",
    "session_start",
    "session_end",
    "session_duration",
];

/// Index of the only non-text column.
pub const SESSION_DURATION_COLUMN: usize = 19;

static RECIPE_ID_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\brecipe\s+id\s*[:=]?\s*"([^"]+)""#).expect("valid regex"));
static RECIPE_ID_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brecipe\s+id\s*[:=]\s*([\w.\-]+)").expect("valid regex"));
static RECIPE_ID_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brecipe\s+#\s*([\w.\-]+)").expect("valid regex"));
static MATERIAL_NAMED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bmaterial\s+"([^"]+)"\s*\(([^)]+)\)"#).expect("valid regex")
});
static MATERIAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bmaterial\s+id\s*[:=]\s*([\w.\-]+)").expect("valid regex"));
static IDENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<name>[^()]*?)\s*\((?P<handle>[^()]*)\)\s*$").expect("valid regex")
});

/// A normalized record with derived and session columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichedRecord {
    pub base: NormalizedRecord,
    pub recipe_id: String,
    pub recipe_name: String,
    pub material_name: String,
    pub material_id: String,
    pub name1: String,
    pub name2: String,
    pub username: String,
    pub action_derived: String,
    pub session_start: String,
    pub session_end: String,
    pub session_duration: Option<i64>,
}

impl EnrichedRecord {
    /// Correlation key: handle (or raw identity) plus recipe id (or recipe name).
    pub fn session_key(&self) -> (String, String) {
        let who = if self.username.is_empty() {
            self.base.user_id.trim().to_string()
        } else {
            self.username.clone()
        };
        let what = if self.recipe_id.is_empty() {
            self.recipe_name.clone()
        } else {
            self.recipe_id.clone()
        };
        (who, what)
    }

    /// The text columns in export order. `session_duration` is carried separately.
    pub fn text_cells(&self) -> [&str; 19] {
        let b = &self.base;
        [
            &b.user_id,
            &b.id,
            &b.subseq_id,
            &b.message,
            &b.audit_time,
            &b.action_raw,
            &b.record_type,
            &b.label,
            &b.version,
            &self.recipe_id,
            &self.recipe_name,
            &self.material_name,
            &self.material_id,
            &self.name1,
            &self.name2,
            &self.username,
            &self.action_derived,
            &self.session_start,
            &self.session_end,
        ]
    }
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Recipe id from the message: quoted explicit id, plain explicit id, then `recipe #X`.
pub fn recipe_id(message: &str) -> String {
    [&*RECIPE_ID_QUOTED, &*RECIPE_ID_PLAIN, &*RECIPE_ID_TOKEN]
        .into_iter()
        .find_map(|re| first_capture(re, message))
        .unwrap_or_default()
}

/// The label, when the record type is `recipe`.
pub fn recipe_name(record_type: &str, label: &str) -> String {
    if record_type.trim().eq_ignore_ascii_case("recipe") {
        label.trim().to_string()
    } else {
        String::new()
    }
}

/// Material `(name, id)` from `material "Name" (ID)` or `material id: ID`.
pub fn material(message: &str) -> (String, String) {
    if let Some(caps) = MATERIAL_NAMED.captures(message) {
        let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let id = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        return (name.to_string(), id.to_string());
    }
    (
        String::new(),
        first_capture(&MATERIAL_ID, message).unwrap_or_default(),
    )
}

/// Split `First Last (handle)` into `(first, rest, handle)`.
pub fn identity(user: &str) -> (String, String, String) {
    let (name, handle) = match IDENTITY.captures(user) {
        Some(caps) => (
            caps.name("name").map(|m| m.as_str()).unwrap_or_default(),
            caps.name("handle")
                .map(|m| m.as_str().trim())
                .unwrap_or_default(),
        ),
        None => (user.trim(), ""),
    };

    let mut tokens = name.split_whitespace();
    let first = tokens.next().unwrap_or_default().to_string();
    let rest = tokens.collect::<Vec<_>>().join(" ");
    (first, rest, handle.to_string())
}

/// First four whitespace-delimited tokens of the message.
pub fn short_action(message: &str) -> String {
    message
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derive every enrichment column for a record.
pub fn enrich(base: NormalizedRecord) -> EnrichedRecord {
    let (material_name, material_id) = material(&base.message);
    let (name1, name2, username) = identity(&base.user_id);
    EnrichedRecord {
        recipe_id: recipe_id(&base.message),
        recipe_name: recipe_name(&base.record_type, &base.label),
        material_name,
        material_id,
        name1,
        name2,
        username,
        action_derived: short_action(&base.message),
        base,
        ..Default::default()
    }
}

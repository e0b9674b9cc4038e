//! Plan file parsing and serialization
//!
//! A plan is the ordered log of a module's changes. Tags mark release
//! boundaries between changes. In-module requires may only point backwards,
//! so they are stored as indices into the change arena rather than as
//! references, and the plan can never describe a cycle.
//!
//! ```text
//! %syntax-version=1.0.0
//! %project=totp
//!
//! schemas/totp 2017-08-11T08:11:51Z Ada <ada@example.com> # add schema
//! procedures/generate [schemas/totp base32:schemas/base32] # generator
//! @v1.2.0 # release
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Default plan file name inside a module directory
pub const PLAN_FILE: &str = "sqlpack.plan";

/// Plan syntax version written by this crate
pub const SYNTAX_VERSION: &str = "1.0.0";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A dependency of one change on another
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Require {
    /// Earlier change in the same plan, by index
    Local(usize),

    /// Change in another module (`module:change`)
    External { module: String, change: String },
}

/// A single change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub requires: Vec<Require>,
    pub planned_at: Option<DateTime<Utc>>,
    pub planner: Option<String>,
    pub note: Option<String>,
}

impl Change {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            planned_at: None,
            planner: None,
            note: None,
        }
    }

    /// Requires on other modules
    pub fn external_requires(&self) -> impl Iterator<Item = (&str, &str)> {
        self.requires.iter().filter_map(|r| match r {
            Require::External { module, change } => Some((module.as_str(), change.as_str())),
            Require::Local(_) => None,
        })
    }
}

/// A release marker after a specific change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,

    /// Index of the change this tag follows
    pub change: usize,

    pub planned_at: Option<DateTime<Utc>>,
    pub planner: Option<String>,
    pub note: Option<String>,
}

/// Ordered changes and tags of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub project: String,
    pub uri: Option<String>,

    /// Pragmas other than syntax-version/project/uri, preserved verbatim
    pub pragmas: Vec<(String, String)>,

    changes: Vec<Change>,
    tags: Vec<Tag>,
}

impl Plan {
    /// Create an empty plan for a project
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            uri: None,
            pragmas: Vec::new(),
            changes: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Load a plan from file
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PlanError::Io(path.display().to_string(), e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse plan text
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let mut project = None;
        let mut uri = None;
        let mut pragmas = Vec::new();
        let mut records = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(pragma) = line.strip_prefix('%') {
                let (key, value) = pragma.split_once('=').ok_or_else(|| PlanError::Malformed {
                    line: line_no,
                    message: format!("pragma '{}' is missing '='", line),
                })?;
                let (key, value) = (key.trim(), value.trim());
                match key {
                    "syntax-version" => {}
                    "project" => project = Some(value.to_string()),
                    "uri" => uri = Some(value.to_string()),
                    _ => pragmas.push((key.to_string(), value.to_string())),
                }
                continue;
            }

            records.push((line_no, parse_record(line, line_no)?));
        }

        let project = project.ok_or(PlanError::MissingProject)?;
        let mut plan = Plan {
            project,
            uri,
            pragmas,
            changes: Vec::new(),
            tags: Vec::new(),
        };

        // Index every change name first so forward references can be told
        // apart from references to changes that do not exist at all.
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut next = 0usize;
        for (line_no, record) in &records {
            if let Record::Change { name, .. } = record {
                if positions.insert(name.as_str(), next).is_some() {
                    return Err(PlanError::DuplicateChange { line: *line_no, name: name.clone() });
                }
                next += 1;
            }
        }

        for (line_no, record) in &records {
            match record {
                Record::Change { name, requires, meta } => {
                    let index = plan.changes.len();
                    let mut change = Change::new(name.clone());
                    change.planned_at = meta.planned_at;
                    change.planner = meta.planner.clone();
                    change.note = meta.note.clone();

                    for raw_req in requires {
                        change.requires.push(resolve_require(
                            raw_req,
                            name,
                            index,
                            &positions,
                            *line_no,
                        )?);
                    }
                    plan.changes.push(change);
                }
                Record::Tag { name, meta } => {
                    if plan.changes.is_empty() {
                        return Err(PlanError::TagBeforeChange { line: *line_no, name: name.clone() });
                    }
                    if plan.tags.iter().any(|t| &t.name == name) {
                        return Err(PlanError::DuplicateTag { line: *line_no, name: name.clone() });
                    }
                    plan.tags.push(Tag {
                        name: name.clone(),
                        change: plan.changes.len() - 1,
                        planned_at: meta.planned_at,
                        planner: meta.planner.clone(),
                        note: meta.note.clone(),
                    });
                }
            }
        }

        Ok(plan)
    }

    /// All changes in plan order
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// All tags in plan order
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn change(&self, index: usize) -> Option<&Change> {
        self.changes.get(index)
    }

    /// Position of a change by name
    pub fn change_index(&self, name: &str) -> Option<usize> {
        self.changes.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Index of the change the last tag follows, if the plan has any tag
    pub fn last_tag_index(&self) -> Option<usize> {
        self.tags.iter().map(|t| t.change).max()
    }

    /// The first tag released at or after a change (the release that contains it)
    pub fn tag_for(&self, index: usize) -> Option<&Tag> {
        self.tags.iter().filter(|t| t.change >= index).min_by_key(|t| t.change)
    }

    /// Name of the change a require points to
    pub fn require_label(&self, require: &Require) -> String {
        match require {
            Require::Local(idx) => self
                .changes
                .get(*idx)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("#{}", idx)),
            Require::External { module, change } => format!("{}:{}", module, change),
        }
    }

    /// Append a change; requires use the same syntax as the plan file
    pub fn add_change(
        &mut self,
        name: &str,
        requires: &[&str],
        planner: Option<&str>,
        note: Option<&str>,
    ) -> Result<usize, PlanError> {
        if !valid_name(name) {
            return Err(PlanError::InvalidName { line: 0, name: name.to_string() });
        }
        if self.change_index(name).is_some() {
            return Err(PlanError::DuplicateChange { line: 0, name: name.to_string() });
        }

        let index = self.changes.len();
        let positions: HashMap<&str, usize> = self
            .changes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();

        let mut change = Change::new(name);
        for raw in requires {
            change.requires.push(resolve_require(raw, name, index, &positions, 0)?);
        }
        change.planned_at = Some(now_seconds());
        change.planner = planner.map(str::to_string);
        change.note = note.map(str::to_string);

        self.changes.push(change);
        Ok(index)
    }

    /// Tag the current last change
    pub fn add_tag(&mut self, name: &str, planner: Option<&str>, note: Option<&str>) -> Result<(), PlanError> {
        let name = name.strip_prefix('@').unwrap_or(name);
        if !valid_name(name) {
            return Err(PlanError::InvalidName { line: 0, name: name.to_string() });
        }
        if self.changes.is_empty() {
            return Err(PlanError::TagBeforeChange { line: 0, name: name.to_string() });
        }
        if self.tags.iter().any(|t| t.name == name) {
            return Err(PlanError::DuplicateTag { line: 0, name: name.to_string() });
        }
        self.tags.push(Tag {
            name: name.to_string(),
            change: self.changes.len() - 1,
            planned_at: Some(now_seconds()),
            planner: planner.map(str::to_string),
            note: note.map(str::to_string),
        });
        Ok(())
    }

    /// Render the plan in file format
    pub fn to_plan_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("%syntax-version={}\n", SYNTAX_VERSION));
        out.push_str(&format!("%project={}\n", self.project));
        if let Some(uri) = &self.uri {
            out.push_str(&format!("%uri={}\n", uri));
        }
        for (key, value) in &self.pragmas {
            out.push_str(&format!("%{}={}\n", key, value));
        }
        out.push('\n');

        for (idx, change) in self.changes.iter().enumerate() {
            let mut line = change.name.clone();
            if !change.requires.is_empty() {
                let labels: Vec<String> = change.requires.iter().map(|r| self.require_label(r)).collect();
                line.push_str(&format!(" [{}]", labels.join(" ")));
            }
            push_meta(&mut line, change.planned_at, change.planner.as_deref(), change.note.as_deref());
            out.push_str(&line);
            out.push('\n');

            for tag in self.tags.iter().filter(|t| t.change == idx) {
                let mut line = format!("@{}", tag.name);
                push_meta(&mut line, tag.planned_at, tag.planner.as_deref(), tag.note.as_deref());
                out.push_str(&line);
                out.push('\n');
            }
        }

        out
    }

    /// Save to file
    pub fn save_to_file(&self, path: &Path) -> Result<(), PlanError> {
        std::fs::write(path, self.to_plan_text())
            .map_err(|e| PlanError::Io(path.display().to_string(), e.to_string()))
    }
}

fn push_meta(line: &mut String, at: Option<DateTime<Utc>>, planner: Option<&str>, note: Option<&str>) {
    if let Some(at) = at {
        line.push(' ');
        line.push_str(&at.format(TIMESTAMP_FORMAT).to_string());
    }
    if let Some(planner) = planner {
        line.push(' ');
        line.push_str(planner);
    }
    if let Some(note) = note {
        line.push_str(" # ");
        line.push_str(note);
    }
}

fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

#[derive(Debug, Default)]
struct Meta {
    planned_at: Option<DateTime<Utc>>,
    planner: Option<String>,
    note: Option<String>,
}

#[derive(Debug)]
enum Record {
    Change { name: String, requires: Vec<String>, meta: Meta },
    Tag { name: String, meta: Meta },
}

fn record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<name>[^\s\[#]+)(?:\s+\[(?P<requires>[^\]]*)\])?(?:\s+(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z))?(?:\s+(?P<planner>[^<#]*?<[^>]*>))?(?:\s*#\s?(?P<note>.*))?$",
        )
        .expect("plan record pattern is valid")
    })
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_./+-]*$").expect("change name pattern is valid")
    })
}

fn valid_name(name: &str) -> bool {
    name_regex().is_match(name) && !name.ends_with('/') && !name.contains("..")
}

fn parse_record(line: &str, line_no: usize) -> Result<Record, PlanError> {
    let caps = record_regex().captures(line).ok_or_else(|| PlanError::Malformed {
        line: line_no,
        message: format!("cannot parse '{}'", line),
    })?;

    let raw_name = &caps["name"];
    let planned_at = match caps.name("ts") {
        Some(ts) => Some(
            NaiveDateTime::parse_from_str(ts.as_str(), TIMESTAMP_FORMAT)
                .map_err(|e| PlanError::Malformed {
                    line: line_no,
                    message: format!("invalid timestamp '{}': {}", ts.as_str(), e),
                })?
                .and_utc(),
        ),
        None => None,
    };
    let meta = Meta {
        planned_at,
        planner: caps.name("planner").map(|m| m.as_str().trim().to_string()),
        note: caps
            .name("note")
            .map(|m| m.as_str().trim().to_string())
            .filter(|n| !n.is_empty()),
    };

    if let Some(tag) = raw_name.strip_prefix('@') {
        if caps.name("requires").is_some() {
            return Err(PlanError::Malformed {
                line: line_no,
                message: format!("tag '@{}' cannot declare requires", tag),
            });
        }
        if !valid_name(tag) {
            return Err(PlanError::InvalidName { line: line_no, name: raw_name.to_string() });
        }
        return Ok(Record::Tag { name: tag.to_string(), meta });
    }

    if !valid_name(raw_name) {
        return Err(PlanError::InvalidName { line: line_no, name: raw_name.to_string() });
    }

    let requires = caps
        .name("requires")
        .map(|m| m.as_str().split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    Ok(Record::Change { name: raw_name.to_string(), requires, meta })
}

fn resolve_require(
    raw: &str,
    change: &str,
    index: usize,
    positions: &HashMap<&str, usize>,
    line: usize,
) -> Result<Require, PlanError> {
    if let Some((module, target)) = raw.split_once(':') {
        if module.is_empty() || !valid_name(target) {
            return Err(PlanError::Malformed {
                line,
                message: format!("invalid cross-module require '{}' on '{}'", raw, change),
            });
        }
        return Ok(Require::External { module: module.to_string(), change: target.to_string() });
    }

    if raw == change {
        return Err(PlanError::SelfRequire { line, change: change.to_string() });
    }

    match positions.get(raw) {
        Some(&pos) if pos < index => Ok(Require::Local(pos)),
        Some(_) => Err(PlanError::ForwardRequire {
            line,
            change: change.to_string(),
            require: raw.to_string(),
        }),
        None => Err(PlanError::UnknownRequire {
            line,
            change: change.to_string(),
            require: raw.to_string(),
        }),
    }
}

/// Plan parsing errors
///
/// `line` is 1-indexed; 0 means the error came from a programmatic edit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Failed to read plan file {0}: {1}")]
    Io(String, String),

    #[error("plan is missing the %project pragma")]
    MissingProject,

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("line {line}: invalid name '{name}'")]
    InvalidName { line: usize, name: String },

    #[error("line {line}: change '{name}' is already planned")]
    DuplicateChange { line: usize, name: String },

    #[error("line {line}: tag '@{name}' already exists")]
    DuplicateTag { line: usize, name: String },

    #[error("line {line}: tag '@{name}' must follow a change")]
    TagBeforeChange { line: usize, name: String },

    #[error("line {line}: change '{change}' requires itself")]
    SelfRequire { line: usize, change: String },

    #[error("line {line}: change '{change}' requires '{require}', which is planned later")]
    ForwardRequire { line: usize, change: String, require: String },

    #[error("line {line}: change '{change}' requires unknown change '{require}'")]
    UnknownRequire { line: usize, change: String, require: String },
}

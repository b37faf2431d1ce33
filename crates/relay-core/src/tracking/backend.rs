//! Issue backends
//!
//! The tracker speaks to an issue system through [`IssueBackend`]. The file
//! backend keeps issues on disk next to the state directory; see
//! [`super::github`] for the hosted one.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::fs::{read_json, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDraft {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueHandle {
    pub id: String,
    pub url: Option<String>,
}

/// An external issue system.
pub trait IssueBackend: Send + Sync {
    fn create(&self, draft: &IssueDraft) -> Result<IssueHandle, TrackingError>;

    fn update(&self, id: &str, draft: &IssueDraft) -> Result<(), TrackingError>;

    /// Whether the issue is still open. Issues can be closed outside relay.
    fn is_open(&self, id: &str) -> Result<bool, TrackingError>;

    fn close(&self, id: &str) -> Result<(), TrackingError>;

    /// An open issue carrying exactly `title`, lowest id first.
    fn find_open(&self, title: &str) -> Result<Option<IssueHandle>, TrackingError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIssue {
    number: u64,
    title: String,
    body: String,
    #[serde(default)]
    labels: Vec<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Issues stored as `<n>.json` plus a readable `<n>.md` in a directory.
///
/// Operators close an issue with `relay issue close <n>` or by setting
/// `"state": "closed"` in its JSON file.
pub struct FileIssueBackend {
    dir: PathBuf,
}

impl FileIssueBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn json_path(&self, id: &str) -> Result<PathBuf, TrackingError> {
        let number: u64 = id
            .parse()
            .map_err(|_| TrackingError::UnknownIssue(id.to_string()))?;
        Ok(self.dir.join(format!("{number}.json")))
    }

    fn load(&self, id: &str) -> Result<StoredIssue, TrackingError> {
        let path = self.json_path(id)?;
        read_json::<StoredIssue>(&path)
            .map_err(|e| TrackingError::Unavailable(format!("{e:#}")))?
            .ok_or_else(|| TrackingError::UnknownIssue(id.to_string()))
    }

    fn store(&self, issue: &StoredIssue) -> Result<(), TrackingError> {
        let json_path = self.dir.join(format!("{}.json", issue.number));
        write_json_atomic(&json_path, issue)
            .map_err(|e| TrackingError::Unavailable(format!("{e:#}")))?;

        let markdown = format!(
            "# {}\n\n_state: {}_\n\n{}",
            issue.title, issue.state, issue.body
        );
        fs::write(self.dir.join(format!("{}.md", issue.number)), markdown)
            .map_err(|e| TrackingError::Unavailable(e.to_string()))
    }

    /// Issue numbers present in the directory.
    fn numbers(&self) -> Result<Vec<u64>, TrackingError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrackingError::Unavailable(e.to_string())),
        };

        let mut numbers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(n) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn highest_number(&self) -> Result<u64, TrackingError> {
        Ok(self.numbers()?.last().copied().unwrap_or(0))
    }

    /// Claim the next free issue number.
    fn reserve(&self) -> Result<u64, TrackingError> {
        fs::create_dir_all(&self.dir).map_err(|e| TrackingError::Unavailable(e.to_string()))?;

        let mut number = self.highest_number()? + 1;
        loop {
            let path = self.dir.join(format!("{number}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(number),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => number += 1,
                Err(e) => return Err(TrackingError::Unavailable(e.to_string())),
            }
        }
    }
}

impl IssueBackend for FileIssueBackend {
    fn create(&self, draft: &IssueDraft) -> Result<IssueHandle, TrackingError> {
        let number = self.reserve()?;
        let now = Utc::now();
        let issue = StoredIssue {
            number,
            title: draft.title.clone(),
            body: draft.body.clone(),
            labels: draft.labels.clone(),
            state: "open".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store(&issue)?;

        Ok(IssueHandle {
            id: number.to_string(),
            url: Some(self.dir.join(format!("{number}.md")).display().to_string()),
        })
    }

    fn update(&self, id: &str, draft: &IssueDraft) -> Result<(), TrackingError> {
        let mut issue = self.load(id)?;
        issue.title = draft.title.clone();
        issue.body = draft.body.clone();
        issue.labels = draft.labels.clone();
        issue.updated_at = Utc::now();
        self.store(&issue)
    }

    fn is_open(&self, id: &str) -> Result<bool, TrackingError> {
        Ok(self.load(id)?.state == "open")
    }

    fn close(&self, id: &str) -> Result<(), TrackingError> {
        let mut issue = self.load(id)?;
        if issue.state != "closed" {
            issue.state = "closed".to_string();
            issue.updated_at = Utc::now();
            self.store(&issue)?;
        }
        Ok(())
    }

    fn find_open(&self, title: &str) -> Result<Option<IssueHandle>, TrackingError> {
        let mut found: Option<u64> = None;
        for number in self.numbers()? {
            // A reserved number may not have been written yet
            let Ok(Some(issue)) = read_json::<StoredIssue>(&self.dir.join(format!("{number}.json")))
            else {
                continue;
            };
            if issue.state == "open" && issue.title == title {
                found = Some(found.map_or(number, |n| n.min(number)));
            }
        }
        Ok(found.map(|number| IssueHandle {
            id: number.to_string(),
            url: Some(self.dir.join(format!("{number}.md")).display().to_string()),
        }))
    }
}

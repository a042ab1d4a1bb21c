//! Save/load of pending download lists.
//!
//! A link list is the serialized form of "everything still queued": one
//! entry per pending job with its source, post identity and destination.
//! The on-disk format is a versioned JSON document with the `.ihl`
//! extension; newer-versioned files are rejected instead of being
//! half-understood.
use std::path::Path;

use ibh_common::serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::queue::{DownloadJob, JobState};

pub const FORMAT_VERSION: u32 = 1;
pub const FILE_EXTENSION: &str = "ihl";

#[derive(Error, Debug)]
pub enum LinkListError {
    #[error("Failed to access link list file: {source}")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },

    #[error("Failed to decode link list: {source}")]
    DecodeError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Link list version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// One pending download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    /// Source identifier the post came from.
    pub source: String,
    pub post_id: u64,
    pub url: String,
    #[serde(default)]
    pub md5: Option<String>,
    /// Relative destination the filename engine resolved.
    pub destination: String,
}

/// An ordered list of pending downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkList {
    pub version: u32,
    pub entries: Vec<LinkEntry>,
}

impl LinkList {
    pub fn new(entries: Vec<LinkEntry>) -> Self {
        Self {
            version: FORMAT_VERSION,
            entries,
        }
    }

    /// Captures the still-pending jobs of a batch, in order.
    pub fn from_jobs<'a>(source: &str, jobs: impl Iterator<Item = &'a DownloadJob>) -> Self {
        let entries = jobs
            .filter(|job| matches!(job.state, JobState::Queued | JobState::Paused))
            .map(|job| LinkEntry {
                source: source.to_string(),
                post_id: job.post.id,
                url: job.post.file_url.clone(),
                md5: job.post.md5.clone(),
                destination: job.dest.to_string_lossy().to_string(),
            })
            .collect();
        Self::new(entries)
    }

    pub async fn save(&self, path: &Path) -> Result<(), LinkListError> {
        let doc = serde_json::to_string_pretty(self)?;
        fs::write(path, doc).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, LinkListError> {
        let doc = fs::read_to_string(path).await?;
        let list: Self = serde_json::from_str(&doc)?;
        if list.version > FORMAT_VERSION {
            return Err(LinkListError::UnsupportedVersion {
                found: list.version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(list)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::JobOutcome;
    use ibh_common::post::Post;
    use std::path::PathBuf;

    fn job(id: u64, state: JobState) -> DownloadJob {
        DownloadJob {
            post: Post {
                id,
                file_url: format!("https://cdn.example/{id}.png"),
                ..Post::default()
            },
            dest: PathBuf::from(format!("out/{id}.png")),
            state,
            attempts: 0,
            bytes: 0,
            error: None,
        }
    }

    #[test]
    fn from_jobs_keeps_only_pending_work() {
        let jobs = vec![
            job(1, JobState::Queued),
            job(2, JobState::Done(JobOutcome::Success)),
            job(3, JobState::Paused),
            job(4, JobState::Cancelled),
        ];
        let list = LinkList::from_jobs("danbooru", jobs.iter());
        let ids: Vec<u64> = list.entries.iter().map(|e| e.post_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(list.entries[0].source, "danbooru");
    }

    fn sample() -> LinkList {
        LinkList::new(vec![
            LinkEntry {
                source: "danbooru".to_string(),
                post_id: 11,
                url: "https://cdn.example/a.png".to_string(),
                md5: Some("aa".to_string()),
                destination: "out/a.png".to_string(),
            },
            LinkEntry {
                source: "gelbooru".to_string(),
                post_id: 22,
                url: "https://cdn.example/b.jpg".to_string(),
                md5: None,
                destination: "out/b.jpg".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.ihl");

        let list = sample();
        list.save(&path).await.unwrap();
        let loaded = LinkList::load(&path).await.unwrap();
        assert_eq!(loaded, list);
        assert_eq!(loaded.entries[0].post_id, 11);
        assert_eq!(loaded.entries[1].post_id, 22);
    }

    #[tokio::test]
    async fn newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.ihl");

        let mut list = sample();
        list.version = FORMAT_VERSION + 1;
        list.save(&path).await.unwrap();

        assert!(matches!(
            LinkList::load(&path).await,
            Err(LinkListError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn missing_optional_fields_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.ihl");
        let doc = r#"{"version":1,"entries":[
            {"source":"danbooru","post_id":5,"url":"https://x/y.png","destination":"y.png"}
        ]}"#;
        tokio::fs::write(&path, doc).await.unwrap();

        let loaded = LinkList::load(&path).await.unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert!(loaded.entries[0].md5.is_none());
    }
}

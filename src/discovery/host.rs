//! CI host model
//!
//! Discovery sees the CI server only through [`JobHost`] / [`HostJob`].
//! [`FsJobHost`] reads a Jenkins-style home directory:
//!
//! ```text
//! <jobs_dir>/<name>/config.xml
//! <jobs_dir>/<folder>/jobs/<name>/...
//! <jobs_dir>/<multibranch>/branches/<branch>/...
//! <job>/builds/<n>/{log, build.xml, gate-params.json, armorcode-gate-used.txt}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::gate::recorder::PARAMS_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub number: u64,
    /// Epoch millis
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub full_name: String,
    pub description: String,
    pub multibranch: bool,
}

pub trait HostJob: Send + Sync {
    /// Slash-joined name, unique per host
    fn full_name(&self) -> &str;
    /// Full name of the enclosing folder, if any
    fn parent_name(&self) -> Option<&str>;
    fn absolute_url(&self) -> Option<String>;
    /// Identifiers of configured build steps
    fn steps(&self) -> Result<Vec<String>>;
    /// Raw job definition text
    fn definition(&self) -> Result<String>;
    fn last_build(&self) -> Option<BuildInfo>;
    fn last_build_parameters(&self) -> Result<Vec<String>>;
    fn last_build_dir(&self) -> Option<PathBuf>;
    fn last_build_log(&self) -> Result<String>;
}

pub trait JobHost: Send + Sync {
    fn all_jobs(&self) -> Result<Vec<Arc<dyn HostJob>>>;
    fn root_url(&self) -> Option<String>;
    fn folder(&self, full_name: &str) -> Option<FolderInfo>;
    /// Direct job children of a folder
    fn children(&self, folder: &str) -> Result<Vec<Arc<dyn HostJob>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Job,
    Folder,
    MultiBranch,
}

/// Jenkins home layout on disk
pub struct FsJobHost {
    jobs_dir: PathBuf,
    root_url: Option<String>,
}

impl FsJobHost {
    pub fn new(jobs_dir: impl Into<PathBuf>, root_url: Option<String>) -> Self {
        Self { jobs_dir: jobs_dir.into(), root_url: root_url.filter(|u| !u.trim().is_empty()) }
    }

    fn walk(&self, dir: &Path, prefix: Option<&str>, out: &mut Vec<Arc<dyn HostJob>>, recurse: bool) -> Result<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.join("config.xml").is_file())
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let full_name = match prefix {
                Some(p) => format!("{}/{}", p, name),
                None => name,
            };

            match item_kind(&path) {
                ItemKind::Job => out.push(Arc::new(FsJob {
                    full_name,
                    parent: prefix.map(str::to_string),
                    dir: path,
                    root_url: self.root_url.clone(),
                })),
                ItemKind::Folder if recurse => self.descend(&path.join("jobs"), &full_name, out),
                ItemKind::MultiBranch if recurse => self.descend(&path.join("branches"), &full_name, out),
                _ => {}
            }
        }
        Ok(())
    }

    /// Nested listings that can't be read are logged and skipped.
    fn descend(&self, dir: &Path, prefix: &str, out: &mut Vec<Arc<dyn HostJob>>) {
        if !dir.exists() {
            return;
        }
        if let Err(e) = self.walk(dir, Some(prefix), out, true) {
            warn!("Skipping jobs under {}: {:#}", prefix, e);
        }
    }

    /// Directory of the item with the given full name
    fn item_dir(&self, full_name: &str) -> Option<PathBuf> {
        let mut dir = self.jobs_dir.clone();
        let mut parent_kind: Option<ItemKind> = None;
        for segment in full_name.split('/') {
            dir = match parent_kind {
                None => dir.join(segment),
                Some(ItemKind::MultiBranch) => dir.join("branches").join(segment),
                Some(_) => dir.join("jobs").join(segment),
            };
            if !dir.join("config.xml").is_file() {
                return None;
            }
            parent_kind = Some(item_kind(&dir));
        }
        Some(dir)
    }
}

impl JobHost for FsJobHost {
    fn all_jobs(&self) -> Result<Vec<Arc<dyn HostJob>>> {
        let mut jobs = Vec::new();
        if !self.jobs_dir.is_dir() {
            debug!("Jobs dir {} does not exist", self.jobs_dir.display());
            return Ok(jobs);
        }
        self.walk(&self.jobs_dir, None, &mut jobs, true)?;
        Ok(jobs)
    }

    fn root_url(&self) -> Option<String> {
        self.root_url.clone()
    }

    fn folder(&self, full_name: &str) -> Option<FolderInfo> {
        let dir = self.item_dir(full_name)?;
        let kind = item_kind(&dir);
        if kind == ItemKind::Job {
            return None;
        }
        let config = std::fs::read_to_string(dir.join("config.xml")).ok()?;
        Some(FolderInfo {
            full_name: full_name.to_string(),
            description: xml_text(&config, "description").unwrap_or_default(),
            multibranch: kind == ItemKind::MultiBranch,
        })
    }

    fn children(&self, folder: &str) -> Result<Vec<Arc<dyn HostJob>>> {
        let Some(dir) = self.item_dir(folder) else {
            return Ok(Vec::new());
        };
        let sub = match item_kind(&dir) {
            ItemKind::MultiBranch => dir.join("branches"),
            ItemKind::Folder => dir.join("jobs"),
            ItemKind::Job => return Ok(Vec::new()),
        };
        let mut jobs = Vec::new();
        if sub.is_dir() {
            self.walk(&sub, Some(folder), &mut jobs, false)?;
        }
        Ok(jobs)
    }
}

struct FsJob {
    full_name: String,
    parent: Option<String>,
    dir: PathBuf,
    root_url: Option<String>,
}

impl FsJob {
    fn last_build_number(&self) -> Option<u64> {
        std::fs::read_dir(self.dir.join("builds"))
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_string_lossy().parse::<u64>().ok())
            .max()
    }
}

impl HostJob for FsJob {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn absolute_url(&self) -> Option<String> {
        let root = self.root_url.as_ref()?;
        let mut url = root.trim_end_matches('/').to_string();
        url.push('/');
        for segment in self.full_name.split('/') {
            url.push_str("job/");
            url.push_str(&urlencoding::encode(segment));
            url.push('/');
        }
        Some(url)
    }

    fn steps(&self) -> Result<Vec<String>> {
        let config = self.definition()?;
        Ok(section(&config, "builders").map(child_tags).unwrap_or_default())
    }

    fn definition(&self) -> Result<String> {
        let path = self.dir.join("config.xml");
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    fn last_build(&self) -> Option<BuildInfo> {
        let number = self.last_build_number()?;
        let dir = self.dir.join("builds").join(number.to_string());
        let timestamp_ms = std::fs::read_to_string(dir.join("build.xml"))
            .ok()
            .and_then(|xml| xml_text(&xml, "timestamp"))
            .and_then(|t| t.trim().parse::<i64>().ok())
            .or_else(|| {
                let modified = std::fs::metadata(&dir).and_then(|m| m.modified()).ok()?;
                let since = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
                i64::try_from(since.as_millis()).ok()
            })
            .unwrap_or(0);
        Some(BuildInfo { number, timestamp_ms })
    }

    fn last_build_parameters(&self) -> Result<Vec<String>> {
        let Some(dir) = self.last_build_dir() else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();

        let build_xml = dir.join("build.xml");
        if build_xml.is_file() {
            let xml = std::fs::read_to_string(&build_xml)?;
            let re = Regex::new(r"<name>\s*([^<]+?)\s*</name>")?;
            names.extend(re.captures_iter(&xml).map(|c| c[1].to_string()));
        }

        let params = dir.join(PARAMS_FILE);
        if params.is_file() {
            let raw = std::fs::read_to_string(&params)?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid {}", params.display()))?;
            if let Some(obj) = value.as_object() {
                names.extend(obj.keys().cloned());
            }
        }
        Ok(names)
    }

    fn last_build_dir(&self) -> Option<PathBuf> {
        self.last_build_number().map(|n| self.dir.join("builds").join(n.to_string()))
    }

    fn last_build_log(&self) -> Result<String> {
        let Some(dir) = self.last_build_dir() else {
            return Ok(String::new());
        };
        let path = dir.join("log");
        if !path.is_file() {
            return Ok(String::new());
        }
        let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn item_kind(dir: &Path) -> ItemKind {
    let Ok(config) = std::fs::read_to_string(dir.join("config.xml")) else {
        return ItemKind::Job;
    };
    let root = root_element(&config).unwrap_or_default();
    if root.contains("MultiBranchProject") {
        ItemKind::MultiBranch
    } else if root.ends_with(".Folder") || root == "folder" || root.ends_with("OrganizationFolder") {
        ItemKind::Folder
    } else {
        ItemKind::Job
    }
}

/// Name of the first element that isn't a declaration or comment
fn root_element(xml: &str) -> Option<String> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
        return Some(rest[..end].to_string());
    }
}

fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

/// Body of the first `<tag>...</tag>` element
fn section<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

/// Tag names of the direct children in an element body
fn child_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut depth = 0usize;
    let mut rest = body;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find('>') else { break };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if tag.starts_with('/') {
            depth = depth.saturating_sub(1);
            continue;
        }
        if depth == 0 {
            let name = tag.split(|c: char| c.is_whitespace() || c == '/').next().unwrap_or_default();
            if !name.is_empty() {
                tags.push(name.to_string());
            }
        }
        if !tag.ends_with('/') {
            depth += 1;
        }
    }
    tags
}

//! Entry-point detection for uploaded work directories.
//!
//! Stages run in a fixed precedence order and the first hit wins:
//!
//! 1. a single file is returned verbatim (`Exact`);
//! 2. canonical entry names at the top level (`High`);
//! 3. the package manifest's `main` field or `start` script (`High`);
//! 4. a `Procfile` `web:`/`worker:` declaration (`High`);
//! 5. canonical entry names one directory level down (`Medium`);
//! 6. content heuristic over candidate files (`Medium`);
//! 7. the first supported file found, runtime A preferred (`Low`).
//!
//! Directory listings are sorted by file name and a directory's own files are
//! visited before those of its subdirectories, so results are deterministic.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::types::{Confidence, DetectionResult, RuntimeKind};
use crate::io::config::DetectorConfig;

const PACKAGE_MANIFEST: &str = "package.json";
const PROCFILE: &str = "Procfile";

/// A supported file found during a depth-limited walk.
#[derive(Debug, Clone)]
struct Candidate {
    /// Slash-separated path relative to the work directory.
    rel: String,
    abs: PathBuf,
    parent: PathBuf,
    runtime: RuntimeKind,
}

#[derive(Debug)]
pub struct Detector {
    cfg: DetectorConfig,
    start_node: Regex,
    start_python: Regex,
    procfile_python: Regex,
    procfile_node: Regex,
}

impl Detector {
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        Ok(Self {
            cfg,
            start_node: Regex::new(r"node\s+(\S+\.js)").context("compile start regex")?,
            start_python: Regex::new(r"python3?\s+(\S+\.py)").context("compile start regex")?,
            procfile_python: Regex::new(r"(?:worker|web):\s*python3?\s+(\S+\.py)")
                .context("compile Procfile regex")?,
            procfile_node: Regex::new(r"(?:worker|web):\s*node\s+(\S+\.js)")
                .context("compile Procfile regex")?,
        })
    }

    /// Propose a runnable entry point for `path`, or `None` when nothing qualifies.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn detect(&self, path: &Path) -> Option<DetectionResult> {
        if path.is_file() {
            let entry = path.file_name()?.to_string_lossy().into_owned();
            let runtime = RuntimeKind::from_path(path)?;
            return Some(found(entry, runtime, Confidence::Exact, "single file"));
        }
        if !path.is_dir() {
            return None;
        }

        self.top_level(path)
            .or_else(|| self.from_manifest(path))
            .or_else(|| self.from_procfile(path))
            .or_else(|| {
                let candidates = self.walk(path, self.cfg.max_depth);
                self.nested_canonical(&candidates)
                    .or_else(|| self.by_content(&candidates))
                    .or_else(|| fallback(&candidates))
            })
    }

    /// Every supported file under `dir` (any depth), for failure reports.
    pub fn candidates(&self, dir: &Path) -> Vec<String> {
        self.walk(dir, usize::MAX - 1)
            .into_iter()
            .map(|c| c.rel)
            .collect()
    }

    /// First file anywhere under `dir` whose name equals `file_name`.
    pub fn find_by_name(&self, dir: &Path, file_name: &str) -> Option<PathBuf> {
        self.entries(dir, usize::MAX - 1)
            .into_iter()
            .find(|entry| entry.file_name() == file_name)
            .map(|entry| entry.into_path())
    }

    fn top_level(&self, dir: &Path) -> Option<DetectionResult> {
        let listed: HashSet<String> = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        self.canonical_names()
            .find(|(name, _)| listed.contains(*name) && dir.join(name).is_file())
            .map(|(name, runtime)| found(name.to_string(), runtime, Confidence::High, "top level"))
    }

    fn from_manifest(&self, dir: &Path) -> Option<DetectionResult> {
        let path = dir.join(PACKAGE_MANIFEST);
        if !path.is_file() {
            return None;
        }
        let manifest: Value = match read_json(&path) {
            Ok(value) => value,
            Err(err) => {
                debug!(err = %format!("{err:#}"), "ignoring unreadable package manifest");
                return None;
            }
        };

        if let Some(main) = manifest.get("main").and_then(Value::as_str) {
            let main = normalize_rel(main);
            if let Some(runtime) = RuntimeKind::from_path(Path::new(&main))
                && dir.join(&main).is_file()
            {
                return Some(found(main, runtime, Confidence::High, "manifest main"));
            }
        }

        let start = manifest
            .get("scripts")
            .and_then(|scripts| scripts.get("start"))
            .and_then(Value::as_str)?;
        [
            (&self.start_node, RuntimeKind::Node),
            (&self.start_python, RuntimeKind::Python),
        ]
        .into_iter()
        .find_map(|(regex, runtime)| existing_capture(dir, regex, start, runtime))
        .map(|(entry, runtime)| found(entry, runtime, Confidence::High, "manifest start script"))
    }

    fn from_procfile(&self, dir: &Path) -> Option<DetectionResult> {
        let path = dir.join(PROCFILE);
        let contents = fs::read_to_string(&path).ok()?;
        [
            (&self.procfile_python, RuntimeKind::Python),
            (&self.procfile_node, RuntimeKind::Node),
        ]
        .into_iter()
        .find_map(|(regex, runtime)| existing_capture(dir, regex, &contents, runtime))
        .map(|(entry, runtime)| found(entry, runtime, Confidence::High, "Procfile"))
    }

    fn nested_canonical(&self, candidates: &[Candidate]) -> Option<DetectionResult> {
        let mut seen_dirs: Vec<&Path> = Vec::new();
        for candidate in candidates {
            if !seen_dirs.contains(&candidate.parent.as_path()) {
                seen_dirs.push(&candidate.parent);
            }
        }
        for dir in seen_dirs {
            let in_dir: Vec<&Candidate> = candidates.iter().filter(|c| c.parent == dir).collect();
            for (name, runtime) in self.canonical_names() {
                if let Some(hit) = in_dir
                    .iter()
                    .find(|c| c.runtime == runtime && file_name_of(&c.abs) == name)
                {
                    return Some(found(hit.rel.clone(), runtime, Confidence::Medium, "nested"));
                }
            }
        }
        None
    }

    fn by_content(&self, candidates: &[Candidate]) -> Option<DetectionResult> {
        [
            (RuntimeKind::Python, &self.cfg.python_keywords),
            (RuntimeKind::Node, &self.cfg.node_keywords),
        ]
        .into_iter()
        .find_map(|(runtime, keywords)| {
            candidates
                .iter()
                .filter(|c| c.runtime == runtime)
                .find(|c| {
                    read_prefix(&c.abs, self.cfg.prefix_bytes)
                        .map(|text| keyword_hits(&text, keywords) >= self.cfg.keyword_threshold)
                        .unwrap_or(false)
                })
                .map(|c| found(c.rel.clone(), runtime, Confidence::Medium, "content heuristic"))
        })
    }

    fn canonical_names(&self) -> impl Iterator<Item = (&str, RuntimeKind)> {
        let python = self
            .cfg
            .python_entries
            .iter()
            .map(|name| (name.as_str(), RuntimeKind::Python));
        let node = self
            .cfg
            .node_entries
            .iter()
            .map(|name| (name.as_str(), RuntimeKind::Node));
        python.chain(node)
    }

    fn walk(&self, dir: &Path, max_depth: usize) -> Vec<Candidate> {
        self.entries(dir, max_depth)
            .into_iter()
            .filter_map(|entry| {
                let runtime = RuntimeKind::from_path(entry.path())?;
                let rel = entry.path().strip_prefix(dir).ok().map(slash_path)?;
                let parent = entry.path().parent()?.to_path_buf();
                Some(Candidate {
                    rel,
                    abs: entry.into_path(),
                    parent,
                    runtime,
                })
            })
            .collect()
    }

    /// Files under `dir` at most `max_depth` directory levels down, shallow first.
    fn entries(&self, dir: &Path, max_depth: usize) -> Vec<DirEntry> {
        let skip = &self.cfg.skip_dirs;
        let mut files: Vec<DirEntry> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth.saturating_add(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && skip
                        .iter()
                        .any(|name| entry.file_name() == name.as_str()))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .collect();
        files.sort_by_key(DirEntry::depth);
        files
    }
}

fn found(entry: String, runtime: RuntimeKind, confidence: Confidence, stage: &str) -> DetectionResult {
    debug!(%entry, ?runtime, ?confidence, stage, "entry point detected");
    DetectionResult {
        entry,
        runtime,
        confidence,
    }
}

fn fallback(candidates: &[Candidate]) -> Option<DetectionResult> {
    [RuntimeKind::Python, RuntimeKind::Node]
        .into_iter()
        .find_map(|runtime| candidates.iter().find(|c| c.runtime == runtime))
        .map(|c| found(c.rel.clone(), c.runtime, Confidence::Low, "fallback"))
}

fn existing_capture(
    dir: &Path,
    regex: &Regex,
    haystack: &str,
    runtime: RuntimeKind,
) -> Option<(String, RuntimeKind)> {
    let entry = normalize_rel(regex.captures(haystack)?.get(1)?.as_str());
    dir.join(&entry).is_file().then_some((entry, runtime))
}

fn keyword_hits(text: &str, keywords: &[String]) -> usize {
    keywords.iter().filter(|k| text.contains(k.as_str())).count()
}

fn read_prefix(path: &Path, limit: usize) -> Result<String> {
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    File::open(path)
        .with_context(|| format!("open {}", path.display()))?
        .take(limit as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_json(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn normalize_rel(entry: &str) -> String {
    entry.trim().trim_start_matches("./").to_string()
}

fn file_name_of(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

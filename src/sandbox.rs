//! Sandboxed Filesystem (spec.md §4.D).
//!
//! All paths are relative to a fixed `project_root`. Every operation
//! enforces: absolute paths rejected; the resolved path's ancestry must
//! include `project_root`; symlinks that would escape are rejected.

use crate::errors::{FsError, PatchError};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "venv",
    ".venv",
    "env",
    "__pycache__",
    "node_modules",
];

/// Bounded edit-distance tolerance for fuzzy patch matching (SPEC_FULL.md
/// §4.D Open Question resolution, DESIGN.md): at most 2 whitespace-
/// normalized line diffs per anchor.
const FUZZY_MAX_LINE_DIFFS: usize = 2;

pub struct SandboxedFs {
    project_root: PathBuf,
}

impl SandboxedFs {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Resolve `rel` against `project_root`, enforcing sandbox containment
    /// (spec.md §4.D invariants 1-3, §8 "Sandbox containment").
    fn resolve(&self, rel: &str) -> Result<PathBuf, FsError> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(FsError::PathEscape(rel_path.to_path_buf()));
        }

        let mut normalized = self.project_root.clone();
        for component in rel_path.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() || !normalized.starts_with(&self.project_root) {
                        return Err(FsError::PathEscape(rel_path.to_path_buf()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::PathEscape(rel_path.to_path_buf()));
                }
            }
        }

        if !normalized.starts_with(&self.project_root) {
            return Err(FsError::PathEscape(rel_path.to_path_buf()));
        }

        // Reject symlinks whose *canonical* target escapes the sandbox.
        // Walk from the first existing ancestor, since the leaf itself may
        // not exist yet (e.g. a pending write).
        let mut probe = normalized.clone();
        while !probe.exists() {
            if !probe.pop() {
                break;
            }
        }
        if let Ok(canonical_probe) = probe.canonicalize() {
            if let Ok(canonical_root) = self.project_root.canonicalize() {
                if !canonical_probe.starts_with(&canonical_root) {
                    return Err(FsError::PathEscape(rel_path.to_path_buf()));
                }
            }
        }

        Ok(normalized)
    }

    pub fn read(&self, rel: &str) -> Result<String, FsError> {
        let path = self.resolve(rel)?;
        std::fs::read_to_string(&path).map_err(|source| FsError::Io { path, source })
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<(), FsError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, content).map_err(|source| FsError::Io { path, source })
    }

    /// Idempotent: deleting a nonexistent file succeeds.
    pub fn delete(&self, rel: &str) -> Result<(), FsError> {
        let path = self.resolve(rel)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FsError::Io { path, source }),
        }
    }

    pub fn exists_file(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn exists_dir(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_dir()).unwrap_or(false)
    }

    pub fn mkdir(&self, rel: &str) -> Result<(), FsError> {
        let path = self.resolve(rel)?;
        std::fs::create_dir_all(&path).map_err(|source| FsError::Io { path, source })
    }

    /// Markdown directory tree, excluding `.git`, virtualenv-like dirs,
    /// `__pycache__`, `node_modules` (spec.md §4.D).
    pub fn directory_tree_markdown(&self) -> String {
        let mut out = String::new();
        self.walk_tree(&self.project_root, 0, &mut out);
        out
    }

    fn walk_tree(&self, dir: &Path, depth: usize, out: &mut String) {
        let Ok(mut entries) = std::fs::read_dir(dir).map(|it| {
            it.filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect::<Vec<_>>()
        }) else {
            return;
        };
        entries.sort();
        for path in entries {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if EXCLUDED_DIRS.contains(&name) {
                continue;
            }
            let indent = "  ".repeat(depth);
            if path.is_dir() {
                out.push_str(&format!("{indent}- {name}/\n"));
                self.walk_tree(&path, depth + 1, out);
            } else {
                out.push_str(&format!("{indent}- {name}\n"));
            }
        }
    }

    // -- Patch application (spec.md §4.D) -----------------------------------

    /// Unified diff with fuzzy fallback: if hunk line numbers don't match,
    /// locate the hunk by anchor-line matching within `FUZZY_MAX_LINE_DIFFS`.
    pub fn apply_unified_diff(&self, rel: &str, diff: &str) -> Result<(), FsError> {
        let original = if self.exists_file(rel) {
            self.read(rel)?
        } else {
            String::new()
        };
        let patched = apply_unified_diff_to_text(&original, diff)?;
        self.write(rel, &patched)
    }

    /// One or more `<<<<<<< SEARCH / ======= / >>>>>>> REPLACE` blocks. A
    /// failed block fails the whole patch.
    pub fn apply_search_replace(&self, rel: &str, patch: &str) -> Result<(), FsError> {
        let original = self.read(rel)?;
        let patched = apply_search_replace_to_text(&original, patch)?;
        self.write(rel, &patched)
    }

    /// Atomic multi-file commit (spec.md §4.D, §8 "Atomic commits").
    ///
    /// Phase 1 backs up every existing target under a per-commit temp
    /// directory inside the sandbox. Phase 2 writes every new content. Any
    /// failure in phase 2 restores every file from backup and deletes files
    /// that had no prior content, leaving the filesystem bit-exact to its
    /// pre-call state.
    pub fn apply_atomic_file_updates(
        &self,
        updates: &HashMap<String, String>,
    ) -> Result<AtomicCommitResult, FsError> {
        let commit_dir = self
            .project_root
            .join(".codewright")
            .join("tmp")
            .join(format!("commit-{}", std::process::id()));
        std::fs::create_dir_all(&commit_dir).map_err(|source| FsError::Io {
            path: commit_dir.clone(),
            source,
        })?;

        let mut backups: HashMap<String, Option<PathBuf>> = HashMap::new();
        for (i, (rel, _)) in updates.iter().enumerate() {
            if self.exists_file(rel) {
                let prior = self.read(rel)?;
                let backup_path = commit_dir.join(format!("{i}.bak"));
                std::fs::write(&backup_path, &prior).map_err(|source| FsError::Io {
                    path: backup_path.clone(),
                    source,
                })?;
                backups.insert(rel.clone(), Some(backup_path));
            } else {
                backups.insert(rel.clone(), None);
            }
        }

        let mut written = Vec::new();
        let mut write_failure = None;
        for (rel, content) in updates {
            match self.write(rel, content) {
                Ok(()) => written.push(rel.clone()),
                Err(e) => {
                    write_failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = write_failure {
            for rel in &written {
                match backups.get(rel) {
                    Some(Some(backup_path)) => {
                        if let Ok(prior) = std::fs::read_to_string(backup_path) {
                            let _ = self.write(rel, &prior);
                        }
                    }
                    Some(None) => {
                        let _ = self.delete(rel);
                    }
                    None => {}
                }
            }
            let _ = std::fs::remove_dir_all(&commit_dir);
            return Err(err);
        }

        Ok(AtomicCommitResult {
            written_paths: written,
            backups,
            commit_dir,
        })
    }

    /// Roll back a prior successful `apply_atomic_file_updates` (used by the
    /// Remediation Manager when post-commit verification fails).
    pub fn rollback(&self, commit: &AtomicCommitResult) -> Result<(), FsError> {
        for rel in &commit.written_paths {
            match commit.backups.get(rel) {
                Some(Some(backup_path)) => {
                    let prior = std::fs::read_to_string(backup_path).map_err(|source| FsError::Io {
                        path: backup_path.clone(),
                        source,
                    })?;
                    self.write(rel, &prior)?;
                }
                Some(None) => {
                    self.delete(rel)?;
                }
                None => {}
            }
        }
        let _ = std::fs::remove_dir_all(&commit.commit_dir);
        Ok(())
    }

    pub fn discard_backups(&self, commit: &AtomicCommitResult) {
        let _ = std::fs::remove_dir_all(&commit.commit_dir);
    }
}

/// Kept in memory for the duration of the surrounding verification step
/// (spec.md §4.D) so the Remediation Manager can roll back on failure.
pub struct AtomicCommitResult {
    pub written_paths: Vec<String>,
    backups: HashMap<String, Option<PathBuf>>,
    commit_dir: PathBuf,
}

// -- Unified diff application ------------------------------------------------

struct Hunk {
    orig_start: usize,
    lines: Vec<DiffLine>,
}

enum DiffLine {
    Context(String),
    Removed(String),
    Added(String),
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks = Vec::new();
    let mut lines = diff.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.starts_with("@@") {
            continue;
        }
        let header = line.trim_start_matches("@@").trim_end_matches("@@").trim();
        let orig_part = header
            .split_whitespace()
            .next()
            .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {line}")))?;
        let orig_start: usize = orig_part
            .trim_start_matches('-')
            .split(',')
            .next()
            .unwrap_or("1")
            .parse()
            .unwrap_or(1);

        let mut hunk_lines = Vec::new();
        while let Some(next) = lines.peek() {
            if next.starts_with("@@") {
                break;
            }
            let next = lines.next().unwrap();
            if let Some(rest) = next.strip_prefix('+') {
                hunk_lines.push(DiffLine::Added(rest.to_string()));
            } else if let Some(rest) = next.strip_prefix('-') {
                hunk_lines.push(DiffLine::Removed(rest.to_string()));
            } else {
                let rest = next.strip_prefix(' ').unwrap_or(next);
                hunk_lines.push(DiffLine::Context(rest.to_string()));
            }
        }
        hunks.push(Hunk {
            orig_start: orig_start.saturating_sub(1),
            lines: hunk_lines,
        });
    }
    if hunks.is_empty() {
        return Err(PatchError::Malformed("no hunks found in diff".to_string()));
    }
    Ok(hunks)
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Anchor-line match within `FUZZY_MAX_LINE_DIFFS` whitespace-normalized
/// line diffs of the declared position.
fn locate_hunk(original_lines: &[&str], hunk: &Hunk) -> Option<usize> {
    let anchor = hunk
        .lines
        .iter()
        .find_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Removed(s) => Some(s.clone()),
            DiffLine::Added(_) => None,
        })
        .unwrap_or_default();
    let anchor_norm = normalize_ws(&anchor);

    // Exact position first.
    if original_lines
        .get(hunk.orig_start)
        .map(|l| normalize_ws(l) == anchor_norm)
        .unwrap_or(false)
    {
        return Some(hunk.orig_start);
    }

    // Search outward from the declared position for a line within the
    // bounded edit-distance tolerance. Rank by closest text match first,
    // breaking ties by proximity to the declared position — otherwise a
    // wildly wrong declared line number can out-rank an exact match simply
    // for sitting closer to the (bogus) line number.
    let mut best: Option<(usize, usize, usize)> = None;
    for (i, line) in original_lines.iter().enumerate() {
        let dist = line_diff_count(&normalize_ws(line), &anchor_norm);
        if dist <= FUZZY_MAX_LINE_DIFFS {
            let offset = i.abs_diff(hunk.orig_start);
            let better = match best {
                None => true,
                Some((best_dist, best_offset, _)) => {
                    (dist, offset) < (best_dist, best_offset)
                }
            };
            if better {
                best = Some((dist, offset, i));
            }
        }
    }
    best.map(|(_, _, i)| i)
}

/// A crude per-token diff count used as the "whitespace-normalized line
/// diff" distance for fuzzy anchor matching — number of differing
/// whitespace-split tokens between the two strings.
fn line_diff_count(a: &str, b: &str) -> usize {
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    let max_len = ta.len().max(tb.len());
    let common = ta.iter().zip(tb.iter()).filter(|(x, y)| x == y).count();
    max_len.saturating_sub(common)
}

fn apply_unified_diff_to_text(original: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    let mut lines: Vec<String> = original.lines().map(String::from).collect();

    // Apply hunks back-to-front so earlier offsets stay valid.
    let mut placements = Vec::with_capacity(hunks.len());
    for hunk in &hunks {
        let borrowed: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let pos = locate_hunk(&borrowed, hunk).ok_or_else(|| PatchError::NoMatch {
            best_similarity: 0.0,
            excerpt: hunk
                .lines
                .iter()
                .take(3)
                .map(|l| match l {
                    DiffLine::Context(s) | DiffLine::Removed(s) | DiffLine::Added(s) => s.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        })?;
        placements.push(pos);
    }

    for (hunk, pos) in hunks.iter().zip(placements.iter()).rev() {
        let mut cursor = *pos;
        let mut replacement = Vec::new();
        for dl in &hunk.lines {
            match dl {
                DiffLine::Context(s) => {
                    replacement.push(s.clone());
                    cursor += 1;
                }
                DiffLine::Removed(_) => {
                    cursor += 1;
                }
                DiffLine::Added(s) => {
                    replacement.push(s.clone());
                }
            }
        }
        let consumed = cursor - *pos;
        lines.splice(*pos..(*pos + consumed).min(lines.len()), replacement);
    }

    Ok(lines.join("\n") + if original.ends_with('\n') { "\n" } else { "" })
}

// -- Search/Replace block application ---------------------------------------

struct SearchReplaceBlock {
    search: String,
    replace: String,
}

fn parse_search_replace_blocks(patch: &str) -> Result<Vec<SearchReplaceBlock>, PatchError> {
    let mut blocks = Vec::new();
    let mut rest = patch;
    while let Some(start) = rest.find("<<<<<<< SEARCH") {
        let after_start = &rest[start + "<<<<<<< SEARCH".len()..];
        let sep = after_start
            .find("=======")
            .ok_or_else(|| PatchError::Malformed("missing ======= separator".to_string()))?;
        let search = after_start[..sep].trim_start_matches('\n').to_string();
        let after_sep = &after_start[sep + "=======".len()..];
        let end = after_sep
            .find(">>>>>>> REPLACE")
            .ok_or_else(|| PatchError::Malformed("missing >>>>>>> REPLACE marker".to_string()))?;
        let replace = after_sep[..end].trim_start_matches('\n').to_string();
        blocks.push(SearchReplaceBlock {
            search: search.trim_end_matches('\n').to_string(),
            replace: replace.trim_end_matches('\n').to_string(),
        });
        rest = &after_sep[end + ">>>>>>> REPLACE".len()..];
    }
    if blocks.is_empty() {
        return Err(PatchError::Malformed(
            "no SEARCH/REPLACE blocks found".to_string(),
        ));
    }
    Ok(blocks)
}

fn apply_search_replace_to_text(original: &str, patch: &str) -> Result<String, PatchError> {
    let blocks = parse_search_replace_blocks(patch)?;
    let mut content = original.to_string();
    for block in blocks {
        content = apply_one_block(&content, &block)?;
    }
    Ok(content)
}

/// Layered matching: exact -> whitespace-insensitive -> anchor-match. On
/// failure, the error carries the best-similarity score and an excerpt of
/// the closest candidate (spec.md §4.D).
fn apply_one_block(content: &str, block: &SearchReplaceBlock) -> Result<String, PatchError> {
    if let Some(idx) = content.find(&block.search) {
        let mut out = String::with_capacity(content.len());
        out.push_str(&content[..idx]);
        out.push_str(&block.replace);
        out.push_str(&content[idx + block.search.len()..]);
        return Ok(out);
    }

    let search_norm = normalize_ws(&block.search);
    let content_lines: Vec<&str> = content.lines().collect();
    let search_lines: Vec<&str> = block.search.lines().collect();
    if !search_lines.is_empty() {
        for start in 0..content_lines.len().saturating_sub(search_lines.len() - 1).max(1) {
            if start + search_lines.len() > content_lines.len() {
                break;
            }
            let window = content_lines[start..start + search_lines.len()].join("\n");
            if normalize_ws(&window) == search_norm {
                let mut new_lines: Vec<String> = content_lines[..start].iter().map(|s| s.to_string()).collect();
                new_lines.extend(block.replace.lines().map(String::from));
                new_lines.extend(
                    content_lines[start + search_lines.len()..]
                        .iter()
                        .map(|s| s.to_string()),
                );
                return Ok(new_lines.join("\n"));
            }
        }
    }

    // Anchor-match: locate the best-matching window by line-diff count
    // against the search block's first line, report the closest candidate.
    let anchor = search_lines.first().copied().unwrap_or("");
    let anchor_norm = normalize_ws(anchor);
    let mut best: Option<(usize, usize, String)> = None;
    for (i, line) in content_lines.iter().enumerate() {
        let dist = line_diff_count(&normalize_ws(line), &anchor_norm);
        let window_len = search_lines.len().max(1);
        let excerpt = content_lines[i..(i + window_len).min(content_lines.len())].join("\n");
        if best.as_ref().map(|(_, best_dist, _)| dist < *best_dist).unwrap_or(true) {
            best = Some((i, dist, excerpt));
        }
    }

    let (_, best_dist, excerpt) = best.unwrap_or((0, usize::MAX, String::new()));
    let max_possible = anchor_norm.split_whitespace().count().max(1);
    let similarity = 1.0 - (best_dist.min(max_possible) as f64 / max_possible as f64);
    Err(PatchError::NoMatch {
        best_similarity: similarity,
        excerpt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, SandboxedFs) {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SandboxedFs::new(tmp.path());
        (tmp, fs)
    }

    #[test]
    fn write_and_read_roundtrip() {
        let (_tmp, fs) = sandbox();
        fs.write("a/b/c.txt", "hello").unwrap();
        assert_eq!(fs.read("a/b/c.txt").unwrap(), "hello");
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let (_tmp, fs) = sandbox();
        assert!(matches!(fs.write("/etc/passwd", "x"), Err(FsError::PathEscape(_))));
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let (_tmp, fs) = sandbox();
        assert!(matches!(
            fs.write("../evil.txt", "x"),
            Err(FsError::PathEscape(_))
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, fs) = sandbox();
        fs.delete("never_existed.txt").unwrap();
        fs.write("x.txt", "y").unwrap();
        fs.delete("x.txt").unwrap();
        fs.delete("x.txt").unwrap();
        assert!(!fs.exists_file("x.txt"));
    }

    #[test]
    fn directory_tree_excludes_known_dirs() {
        let (_tmp, fs) = sandbox();
        fs.write("node_modules/x.js", "").unwrap();
        fs.write("src/main.rs", "").unwrap();
        let tree = fs.directory_tree_markdown();
        assert!(!tree.contains("node_modules"));
        assert!(tree.contains("main.rs"));
    }

    #[test]
    fn atomic_commit_rolls_back_on_failure() {
        let (_tmp, fs) = sandbox();
        fs.write("a.py", "original_a").unwrap();

        // Make b.py's parent a read-only directory so the write fails — but
        // simplest deterministic failure: write to a path that collides
        // with an existing directory.
        fs.mkdir("b.py").unwrap();

        let mut updates = HashMap::new();
        updates.insert("a.py".to_string(), "new_a".to_string());
        updates.insert("b.py".to_string(), "new_b".to_string());

        let result = fs.apply_atomic_file_updates(&updates);
        assert!(result.is_err());
        assert_eq!(fs.read("a.py").unwrap(), "original_a");
    }

    #[test]
    fn atomic_commit_succeeds_and_can_roll_back_later() {
        let (_tmp, fs) = sandbox();
        fs.write("a.py", "original_a").unwrap();

        let mut updates = HashMap::new();
        updates.insert("a.py".to_string(), "new_a".to_string());
        updates.insert("new_file.py".to_string(), "brand_new".to_string());

        let commit = fs.apply_atomic_file_updates(&updates).unwrap();
        assert_eq!(fs.read("a.py").unwrap(), "new_a");
        assert_eq!(fs.read("new_file.py").unwrap(), "brand_new");

        fs.rollback(&commit).unwrap();
        assert_eq!(fs.read("a.py").unwrap(), "original_a");
        assert!(!fs.exists_file("new_file.py"));
    }

    #[test]
    fn search_replace_exact_match() {
        let original = "line1\nline2\nline3\n";
        let patch = "<<<<<<< SEARCH\nline2\n=======\nreplaced\n>>>>>>> REPLACE\n";
        let result = apply_search_replace_to_text(original, patch).unwrap();
        assert_eq!(result, "line1\nreplaced\nline3\n");
    }

    #[test]
    fn search_replace_whitespace_insensitive_match() {
        let original = "def foo():\n    return   1\n";
        let patch = "<<<<<<< SEARCH\nreturn 1\n=======\nreturn 2\n>>>>>>> REPLACE\n";
        let result = apply_search_replace_to_text(original, patch).unwrap();
        assert!(result.contains("return 2"));
    }

    #[test]
    fn search_replace_failure_reports_similarity_and_excerpt() {
        let original = "totally unrelated content\nhere\n";
        let patch = "<<<<<<< SEARCH\nsomething that does not exist\n=======\nfix\n>>>>>>> REPLACE\n";
        let err = apply_search_replace_to_text(original, patch).unwrap_err();
        match err {
            PatchError::NoMatch { best_similarity, excerpt } => {
                assert!(best_similarity <= 1.0);
                assert!(!excerpt.is_empty());
            }
            _ => panic!("expected NoMatch"),
        }
    }

    #[test]
    fn unified_diff_applies_at_exact_position() {
        let original = "a\nb\nc\n";
        let diff = "@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        let result = apply_unified_diff_to_text(original, diff).unwrap();
        assert_eq!(result, "a\nB\nc\n");
    }

    #[test]
    fn unified_diff_fuzzy_fallback_on_wrong_line_number() {
        let original = "a\nb\nc\n";
        // Declares line 10 (way off), but the anchor `b` is unique.
        let diff = "@@ -10,3 +10,3 @@\n a\n-b\n+B\n c\n";
        let result = apply_unified_diff_to_text(original, diff).unwrap();
        assert_eq!(result, "a\nB\nc\n");
    }
}

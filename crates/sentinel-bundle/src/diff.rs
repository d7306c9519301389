//! Diffs between bundle revisions: a line-level Myers diff over the
//! configuration source, and a file-set diff over archive manifests.

use serde::{Deserialize, Serialize};

use sentinel_types::BundleManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    Equal,
    Insert,
    Delete,
}

/// One line of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub op: DiffOp,
    pub text: String,
}

/// Line-level diff from `old` to `new` using the Myers O(ND) algorithm.
pub fn diff_lines(old: &str, new: &str) -> Vec<DiffLine> {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let (n, m) = (a.len() as isize, b.len() as isize);
    let max = n + m;
    if max == 0 {
        return Vec::new();
    }

    // Forward D-path search, recording each round's frontier for backtracking.
    let offset = max;
    let width = (2 * max + 1) as usize;
    let mut v = vec![0isize; width];
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut found_d = None;

    'outer: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                found_d = Some(d);
                break 'outer;
            }
            k += 2;
        }
    }

    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);
    let mut d = found_d.unwrap_or(0);
    while d > 0 {
        let v = &trace[d as usize];
        let k = x - y;
        let idx = (k + offset) as usize;
        let prev_k = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = trace[d as usize][(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;
        while x > prev_x.max(0) && y > prev_y.max(0) && x - y == k {
            x -= 1;
            y -= 1;
            edits.push(DiffLine { op: DiffOp::Equal, text: a[x as usize].to_string() });
        }
        if prev_k == k + 1 {
            // Came from above: an insertion of b[prev_y].
            y -= 1;
            edits.push(DiffLine { op: DiffOp::Insert, text: b[y as usize].to_string() });
        } else {
            x -= 1;
            edits.push(DiffLine { op: DiffOp::Delete, text: a[x as usize].to_string() });
        }
        d -= 1;
    }
    while x > 0 && y > 0 {
        x -= 1;
        y -= 1;
        edits.push(DiffLine { op: DiffOp::Equal, text: a[x as usize].to_string() });
    }
    edits.reverse();
    edits
}

/// Which files changed between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl FileSetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// File-set diff over `manifest.files`, comparing per-file checksums.
pub fn diff_manifests(old: &BundleManifest, new: &BundleManifest) -> FileSetDiff {
    let mut diff = FileSetDiff::default();
    for file in &new.files {
        match old.files.iter().find(|f| f.path == file.path) {
            None => diff.added.push(file.path.clone()),
            Some(prev) if prev.checksum != file.checksum => diff.changed.push(file.path.clone()),
            Some(_) => {}
        }
    }
    for file in &old.files {
        if !new.files.iter().any(|f| f.path == file.path) {
            diff.removed.push(file.path.clone());
        }
    }
    diff
}

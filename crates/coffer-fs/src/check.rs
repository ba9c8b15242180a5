//! Offline consistency check: cross-references the allocator bitmaps
//! against the directory tree.
//!
//! Finds blocks marked used that no file references (orphans, e.g. from
//! a crash mid-operation), blocks referenced but not marked used, double
//! references, and data slots past a file's end.

use std::collections::{HashMap, HashSet};

use coffer_blocks::{LOGICAL_BLOCK_SIZE, SUPERBLOCK_INTERVAL};
use coffer_core::{BlockId, FsResult};

use crate::layout::FileKind;
use crate::volume::{Volume, VolumeInner};
use crate::{dir, file, ROOT_ID};

#[derive(Debug, Default)]
pub struct CheckReport {
    pub files: u64,
    pub directories: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub findings: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl Volume {
    /// Walk the bitmaps and the tree, reporting every inconsistency.
    pub fn check(&self) -> FsResult<CheckReport> {
        self.with_inner(run_check)
    }
}

fn run_check(inner: &mut VolumeInner) -> FsResult<CheckReport> {
    let store = &mut inner.store;
    let mut report = CheckReport {
        free_blocks: store.count_free()?,
        ..Default::default()
    };
    let total = store.total_blocks()?;

    // Pass 1: collect the allocator's view.
    let mut marked: HashSet<BlockId> = HashSet::new();
    let mut region_start = 0u64;
    while region_start < total {
        let bitmap = *store.page(region_start)?;
        let limit = (total - region_start).min(SUPERBLOCK_INTERVAL) as usize;
        for bit in 0..limit {
            if bitmap[bit / 8] & (0x80 >> (bit % 8)) != 0 {
                marked.insert(region_start + bit as u64);
            }
        }
        if bitmap[0] & 0x80 == 0 {
            report
                .findings
                .push(format!("superblock {region_start} is not marked used"));
        }
        region_start += SUPERBLOCK_INTERVAL;
    }
    report.used_blocks = marked.len() as u64;

    // Pass 2: walk the tree, claiming blocks.
    let mut owner: HashMap<BlockId, String> = HashMap::new();
    let mut seen_files: HashSet<BlockId> = HashSet::new();
    let mut pending: Vec<(BlockId, String)> = vec![(ROOT_ID, "/".to_string())];

    while let Some((file_id, path)) = pending.pop() {
        if !seen_files.insert(file_id) {
            report
                .findings
                .push(format!("{path}: header {file_id} referenced more than once"));
            continue;
        }

        let header = match file::read_header(store, file_id) {
            Ok(h) => h,
            Err(err) => {
                report
                    .findings
                    .push(format!("{path}: unreadable header {file_id}: {err}"));
                continue;
            }
        };
        let blocks = match file::collect_blocks(store, file_id) {
            Ok(b) => b,
            Err(err) => {
                report
                    .findings
                    .push(format!("{path}: broken chain: {err}"));
                continue;
            }
        };

        let slots_needed = header.size.div_ceil(LOGICAL_BLOCK_SIZE as u64);
        for (slot, _) in &blocks.data {
            if *slot >= slots_needed {
                report
                    .findings
                    .push(format!("{path}: data slot {slot} lies past the file end"));
            }
        }

        let mut claim = |id: BlockId, what: &str, report: &mut CheckReport| {
            if id >= total {
                report
                    .findings
                    .push(format!("{path}: {what} {id} is out of range"));
                return;
            }
            if !marked.contains(&id) {
                report
                    .findings
                    .push(format!("{path}: {what} {id} is not marked used"));
            }
            if let Some(other) = owner.insert(id, path.clone()) {
                report
                    .findings
                    .push(format!("{path}: {what} {id} already owned by {other}"));
            }
        };
        claim(file_id, "header", &mut report);
        for id in &blocks.continuations {
            claim(*id, "continuation", &mut report);
        }
        for (_, id) in &blocks.data {
            claim(*id, "data block", &mut report);
        }
        for id in &blocks.xattr {
            claim(*id, "xattr block", &mut report);
        }
        drop(claim);

        match header.kind {
            FileKind::Directory => {
                report.directories += 1;
                match dir::list(store, file_id) {
                    Ok(entries) => {
                        for (name, child) in entries {
                            let name = String::from_utf8_lossy(&name).into_owned();
                            let child_path = if path == "/" {
                                format!("/{name}")
                            } else {
                                format!("{path}/{name}")
                            };
                            pending.push((child, child_path));
                        }
                    }
                    Err(err) => {
                        report
                            .findings
                            .push(format!("{path}: unreadable directory: {err}"));
                    }
                }
            }
            FileKind::Regular | FileKind::Symlink => report.files += 1,
        }
    }

    // Pass 3: anything marked used that nobody claimed is an orphan.
    let mut orphans: Vec<BlockId> = marked
        .iter()
        .copied()
        .filter(|id| id % SUPERBLOCK_INTERVAL != 0 && !owner.contains_key(id))
        .collect();
    orphans.sort_unstable();
    for id in orphans {
        report
            .findings
            .push(format!("block {id} is marked used but unreferenced"));
    }

    Ok(report)
}

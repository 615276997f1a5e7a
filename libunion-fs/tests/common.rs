#![allow(dead_code)]

use std::sync::Arc;

use libunion_fs::{BranchDesc, BranchPerm, EntryKind, MemoryLayer, UnionConfig, UnionFs};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Listing cache off, so branch contents may change between reads.
pub fn no_cache() -> UnionConfig {
    UnionConfig {
        rdcache: 0,
        ..Default::default()
    }
}

pub fn union_of(config: UnionConfig, layers: &[(Arc<MemoryLayer>, &str)]) -> UnionFs {
    let descs = layers
        .iter()
        .enumerate()
        .map(|(i, (layer, perm))| {
            let perm: BranchPerm = perm.parse().unwrap();
            BranchDesc::new(format!("/b{i}"), layer.clone()).perm(perm)
        })
        .collect();
    UnionFs::new(config, descs).unwrap()
}

pub fn layers(n: usize) -> Vec<Arc<MemoryLayer>> {
    (0..n).map(|_| Arc::new(MemoryLayer::new())).collect()
}

/// Open `path` (relative to the root), list it, close it.
pub async fn list(fs: &UnionFs, path: &str) -> Vec<(String, EntryKind, usize)> {
    let mut dir = fs.root();
    for name in path.split('/').filter(|n| !n.is_empty()) {
        dir = fs.lookup(&dir, name.as_ref()).await.unwrap();
    }
    let file = fs.open(&dir, 0).await.unwrap();
    let entries = fs.readdir_all(&file).await.unwrap();
    fs.release(&file).await.unwrap();
    entries
        .into_iter()
        .map(|e| (e.name.to_string_lossy().into_owned(), e.kind, e.bindex))
        .collect()
}

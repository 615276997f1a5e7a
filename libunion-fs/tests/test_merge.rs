mod common;

use std::sync::Arc;

use common::{init_logging, layers, list, no_cache, union_of};
use libunion_fs::{BranchDesc, Cursor, EntryKind, MemoryLayer, UnionConfig};

fn entry(name: &str, kind: EntryKind, bindex: usize) -> (String, EntryKind, usize) {
    (name.to_string(), kind, bindex)
}

#[tokio::test]
async fn test_whiteout_hides_lower_entry() {
    init_logging();
    let l = layers(2);
    l[0].create_file("a", 0).await.unwrap();
    l[0].create_whiteout("b").await.unwrap();
    l[1].create_file("b", 0).await.unwrap();
    l[1].mkdir_p("c").await.unwrap();
    let fs = union_of(no_cache(), &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);

    assert_eq!(
        list(&fs, "/").await,
        vec![
            entry("a", EntryKind::File, 0),
            entry("c", EntryKind::Dir, 1),
        ]
    );
    assert!(
        fs.lookup(&fs.root(), "b".as_ref())
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_upper_entry_wins() {
    init_logging();
    let l = layers(2);
    l[0].create_file("x", 1).await.unwrap();
    l[1].create_file("x", 2).await.unwrap();
    l[1].create_file("y", 3).await.unwrap();
    let fs = union_of(no_cache(), &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);

    let listing = list(&fs, "/").await;
    assert_eq!(
        listing,
        vec![
            entry("x", EntryKind::File, 0),
            entry("y", EntryKind::File, 1),
        ]
    );
    let x = fs.lookup(&fs.root(), "x".as_ref()).await.unwrap();
    assert_eq!(fs.getattr(&x).await.unwrap().size, 1);
}

#[tokio::test]
async fn test_whiteout_without_lower_entry_emits_nothing() {
    let l = layers(2);
    l[0].create_whiteout("ghost").await.unwrap();
    l[1].create_file("real", 0).await.unwrap();
    l[1].create_symlink("link").await.unwrap();
    let fs = union_of(no_cache(), &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);
    assert_eq!(
        list(&fs, "/").await,
        vec![
            entry("link", EntryKind::Symlink, 1),
            entry("real", EntryKind::File, 1),
        ]
    );
}

#[tokio::test]
async fn test_opaque_dir_stops_merge() {
    init_logging();
    let l = layers(3);
    l[0].create_file("d/top", 0).await.unwrap();
    l[1].create_file("d/mid", 0).await.unwrap();
    l[1].set_opaque("d").await.unwrap();
    l[2].create_file("d/low", 0).await.unwrap();
    let fs = union_of(
        no_cache(),
        &[
            (l[0].clone(), "rw"),
            (l[1].clone(), "ro+wh"),
            (l[2].clone(), "ro+wh"),
        ],
    );
    assert_eq!(
        list(&fs, "d").await,
        vec![
            entry("top", EntryKind::File, 0),
            entry("mid", EntryKind::File, 1),
        ]
    );
    let d = fs.lookup(&fs.root(), "d".as_ref()).await.unwrap();
    let info = fs.revalidate(&d).await.unwrap();
    assert_eq!(info.bdiropq(), Some(1));
}

#[tokio::test]
async fn test_nested_dirs_merge_per_level() {
    let l = layers(2);
    l[0].create_file("etc/conf/a.conf", 0).await.unwrap();
    l[1].create_file("etc/conf/b.conf", 0).await.unwrap();
    l[1].create_file("etc/hosts", 0).await.unwrap();
    l[0].create_whiteout("etc/conf/c.conf").await.unwrap();
    l[1].create_file("etc/conf/c.conf", 0).await.unwrap();
    let fs = union_of(no_cache(), &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);

    assert_eq!(
        list(&fs, "etc").await,
        vec![
            entry("conf", EntryKind::Dir, 0),
            entry("hosts", EntryKind::File, 1),
        ]
    );
    assert_eq!(
        list(&fs, "etc/conf").await,
        vec![
            entry("a.conf", EntryKind::File, 0),
            entry("b.conf", EntryKind::File, 1),
        ]
    );
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let l = layers(3);
    for i in 0..40 {
        l[i % 3].create_file(format!("f{i:02}"), i as u64).await.unwrap();
    }
    l[0].create_whiteout("f05").await.unwrap();
    let fs = union_of(
        no_cache(),
        &[
            (l[0].clone(), "rw"),
            (l[1].clone(), "ro+wh"),
            (l[2].clone(), "ro+wh"),
        ],
    );

    let root = fs.root();
    let first = fs.open(&root, 0).await.unwrap();
    let second = fs.open(&root, 0).await.unwrap();
    let a = fs.readdir_all(&first).await.unwrap();
    let b = fs.readdir_all(&second).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 39);
    assert!(a.iter().all(|e| e.name != "f05"));

    // union inode numbers are stable across listings
    let again = fs.readdir_all(&first).await.unwrap();
    assert_eq!(a, again);
    fs.release(&first).await.unwrap();
    fs.release(&second).await.unwrap();
}

#[tokio::test]
async fn test_split_reads_match_single_read() {
    init_logging();
    let l = layers(2);
    for i in 0..200 {
        l[i % 2].create_file(format!("name-{i:04}"), 0).await.unwrap();
    }
    let config = UnionConfig {
        rdblk: 1,
        rdcache: 0,
        ..Default::default()
    };
    let fs = union_of(config, &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);
    let root = fs.root();
    let file = fs.open(&root, 0).await.unwrap();

    let mut split = Vec::new();
    let mut cursor = Cursor::START;
    let mut reads = 0;
    loop {
        let blk = fs.read_next_block(&file, cursor).await.unwrap();
        reads += 1;
        split.extend(blk.entries);
        match blk.next {
            Some(next) => {
                assert_eq!(next.pos, split.len());
                cursor = next;
            }
            None => break,
        }
    }
    assert!(reads > 1);

    let whole = fs.readdir_all(&file).await.unwrap();
    assert_eq!(split, whole);
    assert_eq!(whole.len(), 200);

    // restarting from any returned cursor yields the same tail
    let mut cursor = Cursor::START;
    let blk = fs.read_next_block(&file, cursor).await.unwrap();
    cursor = blk.next.unwrap();
    let tail = fs.read_next_block(&file, cursor).await.unwrap();
    let tail_again = fs.read_next_block(&file, cursor).await.unwrap();
    assert_eq!(tail, tail_again);
    assert_eq!(tail.entries[0], whole[cursor.pos]);
    fs.release(&file).await.unwrap();
}

#[tokio::test]
async fn test_cursor_survives_branch_mutation() {
    init_logging();
    let l = layers(1);
    for i in 0..100 {
        l[0].create_file(format!("top-{i:03}"), 0).await.unwrap();
    }
    let config = UnionConfig {
        rdblk: 1,
        rdcache: 0,
        ..Default::default()
    };
    let fs = union_of(config, &[(l[0].clone(), "rw")]);
    let root = fs.root();
    let file = fs.open(&root, 0).await.unwrap();

    let first = fs.read_next_block(&file, Cursor::START).await.unwrap();
    let cursor = first.next.unwrap();

    let bottom = Arc::new(MemoryLayer::new());
    for i in 0..10 {
        bottom.create_file(format!("zz-{i}"), 0).await.unwrap();
    }
    fs.add_branch(BranchDesc::new("/bottom", bottom), 1)
        .await
        .unwrap();
    assert!(fs.file_is_stale(&file).await);

    let mut got = first.entries;
    let mut cursor = Some(cursor);
    while let Some(c) = cursor {
        let blk = fs.read_next_block(&file, c).await.unwrap();
        got.extend(blk.entries);
        cursor = blk.next;
    }
    let names: Vec<_> = got.iter().map(|e| e.name.to_string_lossy().into_owned()).collect();
    assert_eq!(names.len(), 110);
    assert_eq!(names[0], "top-000");
    assert_eq!(names[99], "top-099");
    assert_eq!(names[109], "zz-9");
    fs.release(&file).await.unwrap();
}

#[tokio::test]
async fn test_empty_branch_range_lists_nothing() {
    let l = layers(2);
    l[0].mkdir_p("d").await.unwrap();
    l[0].create_whiteout("d/x").await.unwrap();
    let fs = union_of(no_cache(), &[(l[0].clone(), "rw"), (l[1].clone(), "ro")]);
    assert!(list(&fs, "d").await.is_empty());
    let d = fs.lookup(&fs.root(), "d".as_ref()).await.unwrap();
    assert!(fs.test_empty(&d).await.unwrap());

    let file = fs.open(&d, 0).await.unwrap();
    let blk = fs.read_next_block(&file, Cursor::START).await.unwrap();
    assert!(blk.entries.is_empty());
    assert!(blk.next.is_none());
    fs.release(&file).await.unwrap();
}

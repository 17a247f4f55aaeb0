use super::*;
use crate::btree::key_encoding::encode_i64;
use crate::storage::pager::{Pager, PagerOptions};
use tempfile::TempDir;

fn setup() -> (Pager, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");
    let pager = Pager::create_file(&db, &wal, None, 1, [0u8; 16], PagerOptions::default()).unwrap();
    (pager, dir)
}

#[test]
fn test_insert_and_lookup() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    tree.insert(&mut pager, b"banana", b"yellow").unwrap();
    tree.insert(&mut pager, b"apple", b"red").unwrap();
    tree.insert(&mut pager, b"cherry", b"dark red").unwrap();

    assert_eq!(tree.lookup(&mut pager, b"apple").unwrap(), Some(b"red".to_vec()));
    assert_eq!(tree.lookup(&mut pager, b"banana").unwrap(), Some(b"yellow".to_vec()));
    assert_eq!(tree.lookup(&mut pager, b"durian").unwrap(), None);
}

#[test]
fn test_replace_existing_key() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    tree.insert(&mut pager, b"k", b"v1").unwrap();
    tree.insert(&mut pager, b"k", b"v2").unwrap();
    assert_eq!(tree.lookup(&mut pager, b"k").unwrap(), Some(b"v2".to_vec()));

    let mut count = 0;
    tree.scan(&mut pager, |_, _| {
        count += 1;
        Ok(true)
    })
    .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_split_and_scan_order() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    // Enough entries to force several leaf and interior splits.
    for i in (0..2000i64).rev() {
        tree.insert(&mut pager, &encode_i64(i), format!("value-{}", i).as_bytes())
            .unwrap();
    }

    let mut keys = Vec::new();
    tree.scan(&mut pager, |k, _| {
        keys.push(k.to_vec());
        Ok(true)
    })
    .unwrap();
    assert_eq!(keys.len(), 2000);
    for w in keys.windows(2) {
        assert!(w[0] < w[1], "scan order violated");
    }

    for i in [0i64, 777, 1999] {
        assert_eq!(
            tree.lookup(&mut pager, &encode_i64(i)).unwrap(),
            Some(format!("value-{}", i).into_bytes())
        );
    }
}

#[test]
fn test_delete_with_merges() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    for i in 0..600i64 {
        tree.insert(&mut pager, &encode_i64(i), b"payload-payload-payload")
            .unwrap();
    }
    for i in 0..600i64 {
        if i % 2 == 0 {
            assert!(tree.delete(&mut pager, &encode_i64(i)).unwrap());
        }
    }
    assert!(!tree.delete(&mut pager, &encode_i64(0)).unwrap());

    let mut keys = Vec::new();
    tree.scan(&mut pager, |k, _| {
        keys.push(k.to_vec());
        Ok(true)
    })
    .unwrap();
    assert_eq!(keys.len(), 300);
    for (n, key) in keys.iter().enumerate() {
        assert_eq!(key.as_slice(), &encode_i64(2 * n as i64 + 1));
    }
}

#[test]
fn test_delete_to_empty_collapses_root() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    for i in 0..400i64 {
        tree.insert(&mut pager, &encode_i64(i), b"x").unwrap();
    }
    for i in 0..400i64 {
        assert!(tree.delete(&mut pager, &encode_i64(i)).unwrap());
    }

    let root = pager.read_page_inner(tree.root_page_id()).unwrap();
    assert_eq!(root.page_type(), Some(PageType::Leaf));
    assert_eq!(root.cell_count(), 0);
}

#[test]
fn test_overflow_values_roundtrip() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    let big = vec![0xABu8; 20_000];
    tree.insert(&mut pager, b"big", &big).unwrap();
    tree.insert(&mut pager, b"small", b"tiny").unwrap();

    assert_eq!(tree.lookup(&mut pager, b"big").unwrap(), Some(big.clone()));

    // Replacing the value must free the old chain for reuse.
    let freelist_before = pager.freelist_len();
    tree.insert(&mut pager, b"big", b"now small").unwrap();
    assert!(pager.freelist_len() > freelist_before);
    assert_eq!(
        tree.lookup(&mut pager, b"big").unwrap(),
        Some(b"now small".to_vec())
    );
}

#[test]
fn test_leaf_chain_connected() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    for i in 0..1500i64 {
        tree.insert(&mut pager, &encode_i64(i), b"v").unwrap();
    }

    // Walk the sibling chain from the leftmost leaf and count entries.
    let mut pid = tree.find_leaf(&mut pager, None).unwrap();
    let mut total = 0;
    loop {
        let page = pager.read_page_inner(pid).unwrap();
        assert_eq!(page.page_type(), Some(PageType::Leaf));
        total += page.cell_count() as usize;
        pid = page.right_ptr();
        if pid == 0 {
            break;
        }
    }
    assert_eq!(total, 1500);
}

#[test]
fn test_scan_from_bound() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    for i in 0..100i64 {
        tree.insert(&mut pager, &encode_i64(i), b"v").unwrap();
    }

    let mut seen = Vec::new();
    tree.scan_from(&mut pager, Some(&encode_i64(90)), &mut |k, _| {
        seen.push(k.to_vec());
        Ok(true)
    })
    .unwrap();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0].as_slice(), &encode_i64(90));
}

#[test]
fn test_collect_all_pages_no_duplicates() {
    let (mut pager, _dir) = setup();
    let mut tree = BTree::create(&mut pager).unwrap();

    for i in 0..800i64 {
        tree.insert(&mut pager, &encode_i64(i), b"some payload here").unwrap();
    }
    let pages = tree.collect_all_pages(&mut pager).unwrap();
    let unique: std::collections::HashSet<_> = pages.iter().collect();
    assert_eq!(pages.len(), unique.len());
    assert!(pages.contains(&tree.root_page_id()));
}

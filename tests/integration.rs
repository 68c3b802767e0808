//! Integration tests exercising the public API end to end: the round-trip,
//! canonicalization, skeleton-determinism, git-equivalence and safety
//! properties from the specification's testable-properties section, plus
//! the concrete attack/hardlink/cycle scenarios.
//!
//! Malicious or hand-crafted archives are built as raw ustar bytes directly
//! in this file rather than through the crate's internals, so these tests
//! exercise exactly the contract an external caller depends on.

use std::io::Cursor;

use tartree::{
    create, extract, list, replay_skeleton, rewrite, tree_hash, CreateOptions, ExtractOptions,
    HashAlgorithm, ListOptions, StdHostFs, TarError,
};

fn ustar_octal_field(value: u64, width: usize) -> Vec<u8> {
    let digits = width - 1;
    let s = format!("{value:0digits$o}", digits = digits);
    let mut out = s.into_bytes();
    out.push(0);
    out
}

fn ustar_block(name: &str, typeflag: u8, linkname: &str, size: u64) -> [u8; 512] {
    let mut b = [0u8; 512];
    b[0..name.len()].copy_from_slice(name.as_bytes());

    let mode = ustar_octal_field(0o644, 8);
    b[100..100 + mode.len()].copy_from_slice(&mode);
    let zero8 = ustar_octal_field(0, 8);
    b[108..108 + zero8.len()].copy_from_slice(&zero8);
    b[116..116 + zero8.len()].copy_from_slice(&zero8);
    let size_field = ustar_octal_field(size, 12);
    b[124..124 + size_field.len()].copy_from_slice(&size_field);
    let zero12 = ustar_octal_field(0, 12);
    b[136..136 + zero12.len()].copy_from_slice(&zero12);

    b[148..156].copy_from_slice(b"        ");
    b[156] = typeflag;
    b[157..157 + linkname.len()].copy_from_slice(linkname.as_bytes());
    b[257..263].copy_from_slice(b"ustar\0");
    b[263..265].copy_from_slice(b"00");

    let sum: u32 = b.iter().map(|&x| u32::from(x)).sum();
    let chk = format!("{sum:06o}\0 ");
    b[148..156].copy_from_slice(chk.as_bytes());
    b
}

fn append_entry(buf: &mut Vec<u8>, name: &str, typeflag: u8, linkname: &str, data: &[u8]) {
    buf.extend_from_slice(&ustar_block(name, typeflag, linkname, data.len() as u64));
    buf.extend_from_slice(data);
    let pad = (512 - (data.len() % 512)) % 512;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

fn append_end(buf: &mut Vec<u8>) {
    buf.extend(std::iter::repeat(0u8).take(1024));
}

#[test]
fn s4_symlink_attack_creates_nothing_under_the_prefix() {
    let mut archive = Vec::new();
    append_entry(&mut archive, "link", b'2', "/tmp", &[]);
    append_entry(&mut archive, "link/attack", b'0', "", b"pwned");
    append_end(&mut archive);

    let dir = tempfile::tempdir().unwrap();
    let host = StdHostFs;
    let result = extract(
        Cursor::new(archive),
        dir.path(),
        &host,
        ExtractOptions::default(),
    );
    assert!(result.is_err());
    assert!(!dir.path().join("link").join("attack").exists());
}

#[test]
fn s5_hardlink_extracts_as_copy_with_matching_tree_hash() {
    let content = vec![b'x'; 1000];
    let mut archive = Vec::new();
    append_entry(&mut archive, "a", b'0', "", &content);
    append_entry(&mut archive, "b", b'1', "a", &[]);
    append_end(&mut archive);

    let dir = tempfile::tempdir().unwrap();
    let host = StdHostFs;
    extract(
        Cursor::new(archive.clone()),
        dir.path(),
        &host,
        ExtractOptions::default(),
    )
    .unwrap();
    assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), content);
    assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), content);

    let mut plain = Vec::new();
    append_entry(&mut plain, "a", b'0', "", &content);
    append_entry(&mut plain, "b", b'0', "", &content);
    append_end(&mut plain);

    let hardlinked_hash =
        tree_hash(Cursor::new(archive), HashAlgorithm::GitSha1, false, None).unwrap();
    let plain_hash = tree_hash(Cursor::new(plain), HashAlgorithm::GitSha1, false, None).unwrap();
    assert_eq!(hardlinked_hash, plain_hash);
}

#[test]
fn s6_copy_symlinks_cycle_leaves_nothing_and_does_not_error() {
    let mut archive = Vec::new();
    append_entry(&mut archive, "A", b'2', "B", &[]);
    append_entry(&mut archive, "B", b'2', "A", &[]);
    append_end(&mut archive);

    let dir = tempfile::tempdir().unwrap();
    let host = StdHostFs;
    let mut options = ExtractOptions::default();
    options.copy_symlinks = tartree::CopySymlinks::True;
    extract(Cursor::new(archive), dir.path(), &host, options).unwrap();

    assert!(!dir.path().join("A").exists());
    assert!(!dir.path().join("B").exists());
}

#[test]
fn s7_git_sha256_empty_tree() {
    let mut archive = Vec::new();
    append_entry(&mut archive, ".", b'5', "", &[]);
    append_end(&mut archive);

    let hash = tree_hash(Cursor::new(archive), HashAlgorithm::GitSha256, true, None).unwrap();
    assert_eq!(
        hash,
        "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321"
    );
}

#[test]
fn round_trip_extract_then_create_preserves_tree_hash() {
    let host = StdHostFs;
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
    std::fs::create_dir(src.path().join("sub")).unwrap();
    std::fs::write(src.path().join("sub").join("b.txt"), b"world").unwrap();

    let mut original = Vec::new();
    create(&mut original, src.path(), &host, &mut CreateOptions::default()).unwrap();

    let extracted = tempfile::tempdir().unwrap();
    extract(
        Cursor::new(original.clone()),
        extracted.path(),
        &host,
        ExtractOptions::default(),
    )
    .unwrap();

    let mut roundtripped = Vec::new();
    create(
        &mut roundtripped,
        extracted.path(),
        &host,
        &mut CreateOptions::default(),
    )
    .unwrap();

    let original_hash =
        tree_hash(Cursor::new(original), HashAlgorithm::GitSha1, false, None).unwrap();
    let roundtripped_hash =
        tree_hash(Cursor::new(roundtripped), HashAlgorithm::GitSha1, false, None).unwrap();
    assert_eq!(original_hash, roundtripped_hash);
}

#[test]
fn rewrite_is_idempotent_on_a_canonical_input() {
    let host = StdHostFs;
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("z.txt"), b"last").unwrap();
    std::fs::write(src.path().join("a.txt"), b"first").unwrap();

    let mut canonical = Vec::new();
    create(&mut canonical, src.path(), &host, &mut CreateOptions::default()).unwrap();

    let mut once = Vec::new();
    rewrite(Cursor::new(canonical), &mut once, None, false).unwrap();

    let mut twice = Vec::new();
    rewrite(Cursor::new(once.clone()), &mut twice, None, false).unwrap();

    assert_eq!(once, twice);
}

#[test]
fn skeleton_reconstructs_original_bytes() {
    let host = StdHostFs;
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello world").unwrap();

    let mut original = Vec::new();
    create(&mut original, src.path(), &host, &mut CreateOptions::default()).unwrap();

    let extract_dir = tempfile::tempdir().unwrap();
    let mut skeleton_bytes = Vec::new();
    let mut options = ExtractOptions::default();
    options.skeleton_sink = Some(&mut skeleton_bytes);
    extract(
        Cursor::new(original.clone()),
        extract_dir.path(),
        &host,
        options,
    )
    .unwrap();

    let mut replayed = Vec::new();
    replay_skeleton(
        Cursor::new(skeleton_bytes),
        extract_dir.path(),
        &host,
        &mut replayed,
    )
    .unwrap();

    assert_eq!(replayed, original);
}

#[test]
fn list_surfaces_unsupported_entry_types_only_in_strict_mode() {
    let mut archive = Vec::new();
    append_entry(&mut archive, "dev", b'3', "", &[]); // chardev
    append_end(&mut archive);

    let strict = list(Cursor::new(archive.clone()), ListOptions::default());
    assert!(matches!(strict, Err(TarError::UnsupportedEntry(_))));

    let mut lenient = ListOptions::default();
    lenient.strict = false;
    let headers = list(Cursor::new(archive), lenient).unwrap();
    assert_eq!(headers.len(), 1);
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_device::Compiler;
use kiln_schedule::{Choice, ChoiceKind, ChoiceStore, SearchChoice};

use crate::store::{CACHE_VERSION, COMPILE_TABLE, KOPT_TABLE};
use crate::{KeyValueStore, KoptTable, MemoryStore, SledStore, compile_cached, compile_key};

#[derive(Default)]
struct CountingCompiler {
    calls: AtomicUsize,
    key: Option<&'static str>,
}

impl Compiler for CountingCompiler {
    fn compile(&self, src: &str) -> kiln_device::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(src.to_uppercase().into_bytes())
    }

    fn cache_key(&self) -> Option<&str> {
        self.key
    }
}

#[test]
fn test_sled_roundtrip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.db");
    {
        let store = SledStore::open(&path).unwrap();
        store.put(COMPILE_TABLE, b"k", b"artifact").unwrap();
        assert_eq!(store.get(COMPILE_TABLE, b"k").unwrap().as_deref(), Some(&b"artifact"[..]));
    }
    let store = SledStore::open(&path).unwrap();
    assert_eq!(store.get(COMPILE_TABLE, b"k").unwrap().as_deref(), Some(&b"artifact"[..]));
    assert_eq!(store.get(KOPT_TABLE, b"k").unwrap(), None);
}

#[test]
fn test_sled_tables_carry_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.db");
    SledStore::open(&path).unwrap().put(KOPT_TABLE, b"k", b"v").unwrap();

    let db = sled::open(&path).unwrap();
    let expected = format!("{KOPT_TABLE}_{CACHE_VERSION}");
    assert!(db.tree_names().iter().any(|n| n.as_ref() == expected.as_bytes()));
}

#[test]
fn test_memory_store_tables_are_separate() {
    let store = MemoryStore::new();
    store.put(COMPILE_TABLE, b"a", b"1").unwrap();
    store.put(KOPT_TABLE, b"a", b"2").unwrap();
    store.put(KOPT_TABLE, b"a", b"3").unwrap();

    assert_eq!(store.get(COMPILE_TABLE, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(KOPT_TABLE, b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(store.len(KOPT_TABLE), 1);
}

#[test]
fn test_kopt_table_roundtrip() {
    let store = MemoryStore::new();
    let table = KoptTable(&store);
    let choice = SearchChoice::Opts(vec![Choice { axis: 0, amount: 4, kind: ChoiceKind::Upcast }]);

    assert_eq!(table.get("EMU-1-kernel"), None);
    table.put("EMU-1-kernel", &choice);
    assert_eq!(table.get("EMU-1-kernel"), Some(choice));
    table.put("EMU-1-other", &SearchChoice::Baseline);
    assert_eq!(table.get("EMU-1-other"), Some(SearchChoice::Baseline));
}

#[test]
fn test_kopt_table_ignores_garbage() {
    let store = MemoryStore::new();
    store.put(KOPT_TABLE, b"key", b"not json").unwrap();
    assert_eq!(KoptTable(&store).get("key"), None);
}

#[test]
fn test_compile_key_depends_on_compiler_and_source() {
    let a = compile_key("interp", "src");
    assert_eq!(a, compile_key("interp", "src"));
    assert_ne!(a, compile_key("interp", "src2"));
    assert_ne!(a, compile_key("other", "src"));
    assert!(a.starts_with("interp-"));
}

#[test]
fn test_compile_cached_reuses_artifact() {
    let store = MemoryStore::new();
    let compiler = CountingCompiler { key: Some("count"), ..Default::default() };

    let first = compile_cached(&compiler, "abc", Some(&store)).unwrap();
    let second = compile_cached(&compiler, "abc", Some(&store)).unwrap();
    assert_eq!(first, b"ABC");
    assert_eq!(first, second);
    assert_eq!(compiler.calls.load(Ordering::Relaxed), 1);
    assert_eq!(store.len(COMPILE_TABLE), 1);

    compile_cached(&compiler, "xyz", Some(&store)).unwrap();
    assert_eq!(compiler.calls.load(Ordering::Relaxed), 2);
}

#[test]
fn test_compile_cached_without_key_or_store_always_compiles() {
    let store = Arc::new(MemoryStore::new());
    let keyless = CountingCompiler::default();
    compile_cached(&keyless, "abc", Some(&*store)).unwrap();
    compile_cached(&keyless, "abc", Some(&*store)).unwrap();
    assert_eq!(keyless.calls.load(Ordering::Relaxed), 2);
    assert_eq!(store.len(COMPILE_TABLE), 0);

    let keyed = CountingCompiler { key: Some("count"), ..Default::default() };
    compile_cached(&keyed, "abc", None).unwrap();
    compile_cached(&keyed, "abc", None).unwrap();
    assert_eq!(keyed.calls.load(Ordering::Relaxed), 2);
}

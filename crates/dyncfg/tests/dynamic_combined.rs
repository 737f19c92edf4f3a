use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use dyncfg::interpol::{InterpolatorSpecification, ThreadContext};
use dyncfg::{
    Configuration, ConfigurationBuilder, DynamicCombinedConfiguration, FileParameters,
    MultiFileBuilder, MultiFileParameters, ReloadCheck,
};
use filetime::FileTime;
use tempfile::TempDir;

const READS_PER_THREAD: usize = 100;
const REWRITES: i64 = 20;

fn multi_tenant_files() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("multitenant-2002.toml"), "rowsPerPage = 25\n").unwrap();
    fs::write(dir.path().join("multitenant-3001.toml"), "rowsPerPage = 15\n").unwrap();
    dir
}

fn context_spec() -> InterpolatorSpecification {
    InterpolatorSpecification::new().with_default_prefix_lookups()
}

fn resolver(dir: &TempDir) -> Arc<MultiFileBuilder> {
    Arc::new(MultiFileBuilder::new(
        MultiFileParameters::new("multitenant-${ctx:Id}.toml")
            .with_interpolator(context_spec())
            .with_managed(
                FileParameters::default()
                    .with_base_path(dir.path())
                    .with_allow_fail_on_init(true),
            ),
    ))
}

fn combined(resolver: &Arc<MultiFileBuilder>) -> Arc<DynamicCombinedConfiguration> {
    let view = DynamicCombinedConfiguration::new()
        .with_key_pattern("${ctx:Id}")
        .with_interpolator(context_spec());
    view.add_configuration(
        "defaults",
        Configuration::from_toml("rowsPerPage = 50\ntitle = \"Catalog\"\n").unwrap(),
    )
    .unwrap();
    view.add_builder("clients", Arc::clone(resolver)).unwrap();
    Arc::new(view)
}

#[test]
fn concurrent_reads_survive_resets() {
    let dir = multi_tenant_files();
    let resolver = resolver(&dir);
    let view = combined(&resolver);

    let wrong = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = [(None, "50"), (Some("2002"), "25"), (Some("3001"), "15")]
        .into_iter()
        .map(|(id, expected)| {
            let view = Arc::clone(&view);
            let wrong = Arc::clone(&wrong);
            thread::spawn(move || {
                let _ctx = id.map(|id| ThreadContext::scoped("Id", id));
                for i in 0..READS_PER_THREAD {
                    let value = if i % 2 == 0 {
                        view.get_string("rowsPerPage")
                    } else {
                        view.snapshot().map(|s| s.get_string("rowsPerPage"))
                    };
                    match value {
                        Ok(Some(value)) if value == expected => {}
                        other => {
                            eprintln!("context {id:?}: expected {expected}, got {other:?}");
                            wrong.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        })
        .collect();

    let resetter = {
        let resolver = Arc::clone(&resolver);
        let view = Arc::clone(&view);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut round = 0usize;
            while !done.load(Ordering::SeqCst) {
                match round % 3 {
                    0 => resolver.reset_parameters(),
                    1 => {
                        let builders = resolver.managed_builders();
                        if !builders.is_empty() {
                            builders[round % builders.len()].1.reset_result();
                        }
                    }
                    _ => view.invalidate(),
                }
                round += 1;
                thread::sleep(Duration::from_millis(1));
            }
            round
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let rounds = resetter.join().unwrap();

    assert_eq!(wrong.load(Ordering::SeqCst), 0);
    assert!(rounds > 0);
}

#[test]
fn dynamic_source_shadows_defaults() {
    let dir = multi_tenant_files();
    let resolver = resolver(&dir);
    let view = combined(&resolver);

    let _ctx = ThreadContext::scoped("Id", "2002");
    // Defined by both: the context-dependent source wins
    assert_eq!(view.get_i64("rowsPerPage").unwrap(), Some(25));
    // Defined only by the defaults
    assert_eq!(view.get_string("title").unwrap().as_deref(), Some("Catalog"));
    // Defined nowhere
    assert_eq!(view.get("pageSize").unwrap(), None);
}

#[test]
fn registration_order_does_not_demote_dynamic_sources() {
    let dir = multi_tenant_files();
    let resolver = resolver(&dir);

    let view = DynamicCombinedConfiguration::new()
        .with_key_pattern("${ctx:Id}")
        .with_interpolator(context_spec());
    view.add_builder("clients", Arc::clone(&resolver)).unwrap();
    view.add_configuration("first", Configuration::from_toml("rowsPerPage = 1").unwrap())
        .unwrap();
    view.add_configuration(
        "second",
        Configuration::from_toml("rowsPerPage = 2\nlocale = \"de\"").unwrap(),
    )
    .unwrap();

    let _ctx = ThreadContext::scoped("Id", "3001");
    assert_eq!(view.get_i64("rowsPerPage").unwrap(), Some(15));
    assert_eq!(view.get_string("locale").unwrap().as_deref(), Some("de"));

    let snapshot = view.snapshot().unwrap();
    assert_eq!(snapshot.get_i64("rowsPerPage"), Some(15));
    assert_eq!(snapshot.get_string("locale").as_deref(), Some("de"));
}

#[test]
fn resolver_reset_invalidates_snapshots() {
    let dir = multi_tenant_files();
    let resolver = resolver(&dir);
    let view = combined(&resolver);
    let _ctx = ThreadContext::scoped("Id", "2002");

    view.snapshot().unwrap();
    let before = view.snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &view.snapshot().unwrap()));

    fs::write(dir.path().join("multitenant-2002.toml"), "rowsPerPage = 30\n").unwrap();
    resolver.reset_parameters();

    let after = view.snapshot().unwrap();
    assert_eq!(after.get_i64("rowsPerPage"), Some(30));
    assert_eq!(before.get_i64("rowsPerPage"), Some(25));
}

/// Replace the file in one step and move its mtime past every earlier write
fn rewrite(path: &Path, round: i64) {
    let staged = path.with_extension("new");
    fs::write(&staged, format!("rowsPerPage = {round}\n")).unwrap();
    fs::rename(&staged, path).unwrap();
    let mtime = SystemTime::now() + Duration::from_secs(60 * (round as u64 + 1));
    filetime::set_file_mtime(path, FileTime::from_system_time(mtime)).unwrap();
}

#[test]
fn concurrent_reads_while_file_reloads() {
    let dir = multi_tenant_files();
    let resolver = Arc::new(MultiFileBuilder::new(
        MultiFileParameters::new("multitenant-${ctx:Id}.toml")
            .with_interpolator(context_spec())
            .with_managed(
                FileParameters::default()
                    .with_base_path(dir.path())
                    .with_reloading(true)
                    .with_refresh_delay(Duration::ZERO),
            ),
    ));
    let done = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            let done = Arc::clone(&done);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                let _ctx = ThreadContext::scoped("Id", "2002");
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) || reads == 0 {
                    match resolver.configuration().map(|c| c.get_i64("rowsPerPage")) {
                        Ok(Some(25)) => {}
                        Ok(Some(value)) if (0..REWRITES).contains(&value) => {}
                        other => {
                            eprintln!("unexpected read: {other:?}");
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    let writer = {
        let controller = resolver.reloading_controller();
        let path = dir.path().join("multitenant-2002.toml");
        thread::spawn(move || {
            for round in 0..REWRITES {
                rewrite(&path, round);
                controller.check_for_reloading(None);
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    writer.join().unwrap();
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    // Whatever the interleaving, the change written last is picked up
    resolver.reloading_controller().check_for_reloading(None);
    let _ctx = ThreadContext::scoped("Id", "2002");
    assert_eq!(
        resolver.configuration().unwrap().get_i64("rowsPerPage"),
        Some(REWRITES - 1)
    );
    assert_eq!(resolver.managed_builders().len(), 1);
}

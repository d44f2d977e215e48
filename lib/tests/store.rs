use oxtdb::loader::{
    IndexBuildStrategy, LoadPhase, LoadTarget, LoaderError, MonitorOptions, ProgressEvent,
    StatisticsOutcome, StatisticsSummary, STATISTICS_FILE,
};
use oxtdb::model::vocab::rdf;
use oxtdb::model::*;
use oxtdb::store::{StorageError, Store, StoreOptions};
use std::error::Error;
use std::sync::{Arc, Mutex};

const EX: &str = "http://example.com/";

fn node(name: impl std::fmt::Display) -> NamedNode {
    NamedNode::new_unchecked(format!("{EX}{name}"))
}

/// Triples over 100 subjects, 5 predicates and one literal per triple.
fn triples(count: usize) -> Vec<Quad> {
    (0..count)
        .map(|i| {
            Quad::new(
                node(format!("s{}", i % 100)),
                node(format!("p{}", i % 5)),
                Literal::from(i as i64),
                GraphName::DefaultGraph,
            )
        })
        .collect()
}

fn dataset() -> Vec<Quad> {
    let mut quads = triples(500);
    for i in 0..300 {
        quads.push(Quad::new(
            node(format!("s{}", i % 17)),
            if i % 3 == 0 {
                rdf::TYPE.into_owned()
            } else {
                node("p0")
            },
            node(format!("o{}", i % 29)),
            node(format!("g{}", i % 4)),
        ));
    }
    quads.push(Quad::new(
        BlankNode::new_unchecked("b1"),
        node("p0"),
        Literal::new_language_tagged_literal_unchecked("chat", "fr"),
        BlankNode::new_unchecked("bg"),
    ));
    quads
}

fn sorted_content(store: &Store) -> Result<Vec<String>, StorageError> {
    let mut content = store
        .iter()
        .map(|q| q.map(|q| q.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    content.sort();
    Ok(content)
}

#[test]
fn test_load_into_empty_store() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let report = store
        .bulk_loader()
        .with_target(LoadTarget::DefaultGraph)
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(triples(10_000).into_iter().map(Ok))?;

    assert!(report.started_empty);
    assert_eq!(report.statements, 10_000);
    assert_eq!(report.tuples_added, 10_000);
    assert_eq!(report.indexes.len(), 2);
    assert!(report.indexes.iter().all(|index| index.tuples == 10_000));
    assert!(store.detached_indexes().is_empty());
    assert_eq!(store.len()?, 10_000);

    let p0 = node("p0");
    assert_eq!(
        store
            .quads_for_pattern(None, Some(p0.as_ref()), None, None)
            .count(),
        2000
    );
    let object = Literal::from(4242_i64);
    assert_eq!(
        store
            .quads_for_pattern(None, None, Some(object.as_ref().into()), None)
            .count(),
        1
    );
    let s7 = node("s7");
    assert_eq!(
        store
            .quads_for_pattern(Some(s7.as_ref().into()), None, None, None)
            .count(),
        100
    );
    store.validate()?;

    let path = match report.statistics_outcome {
        StatisticsOutcome::Written(path) => path,
        outcome => panic!("the statistics should have been written, got {outcome:?}"),
    };
    assert_eq!(path, dir.path().join(STATISTICS_FILE));
    let summary = StatisticsSummary::read(&path)?;
    assert_eq!(Some(&summary), report.statistics.as_ref());
    assert_eq!(summary.total, 10_000);
    for p in 0..5 {
        assert_eq!(summary.predicate_count(&node(format!("p{p}")).to_string()), 2000);
    }
    Ok(())
}

#[test]
fn test_quad_rejected_by_default_graph_target() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let mut session = store
        .bulk_loader()
        .with_target(LoadTarget::DefaultGraph)
        .without_progress()
        .start()?;
    session.add(&Quad::new(node("s"), node("p"), node("o"), GraphName::DefaultGraph))?;
    let quad = Quad::new(node("s"), node("p"), node("o"), node("g"));
    match session.add(&quad) {
        Err(LoaderError::InvalidStatement { statement, .. }) => assert_eq!(statement, 2),
        result => panic!("the quad should be rejected, got {result:?}"),
    }
    assert_eq!(store.triples().primary().len()?, 1);
    assert_eq!(store.quads().len()?, 0);
    assert!(matches!(
        session.add(&Quad::new(node("s2"), node("p"), node("o"), GraphName::DefaultGraph)),
        Err(LoaderError::Aborted)
    ));
    assert!(matches!(session.finish(), Err(LoaderError::Aborted)));

    // the secondary indexes stay detached until rebuilt
    assert_eq!(store.detached_indexes(), ["triples_pos", "triples_osp"]);
    let built = store.rebuild_indexes(IndexBuildStrategy::Sequential)?;
    assert_eq!(built.len(), 2);
    assert!(store.detached_indexes().is_empty());
    assert_eq!(store.len()?, 1);
    store.validate()?;
    Ok(())
}

#[test]
fn test_named_graph_target() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let graph = node("g");
    let mut session = store
        .bulk_loader()
        .with_target(LoadTarget::NamedGraph(graph.clone()))
        .without_progress()
        .start()?;
    session.add_triple(&Triple::new(node("s"), node("p"), node("o")))?;
    session.add(&Quad::new(node("s"), node("p"), node("o2"), graph.clone()))?;
    let report = session.finish()?;

    assert_eq!(report.tuples_added, 2);
    assert_eq!(report.indexes.len(), 5);
    assert!(store.triples().is_empty()?);
    assert_eq!(
        store
            .quads_for_pattern(None, None, None, Some(graph.as_ref().into()))
            .count(),
        2
    );
    assert!(matches!(report.statistics_outcome, StatisticsOutcome::Collected));
    assert_eq!(
        report
            .statistics
            .as_ref()
            .map(|summary| summary.predicate_count(&node("p").to_string())),
        Some(2)
    );

    let mut session = store
        .bulk_loader()
        .with_target(LoadTarget::NamedGraph(graph))
        .without_progress()
        .start()?;
    assert!(matches!(
        session.add(&Quad::new(node("s"), node("p"), node("o"), node("other"))),
        Err(LoaderError::InvalidStatement { statement: 1, .. })
    ));
    Ok(())
}

#[test]
fn test_load_into_non_empty_store() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert(&Quad::new(node("s"), node("p"), node("o"), GraphName::DefaultGraph))?;

    let mut session = store.bulk_loader().without_progress().start()?;
    assert!(!session.started_empty());
    assert_eq!(session.phase(), LoadPhase::Data);
    assert!(store.detached_indexes().is_empty());
    for quad in triples(1000) {
        session.add(&quad)?;
    }
    // every index is maintained while the load is running
    let p3 = node("p3");
    assert_eq!(
        store
            .quads_for_pattern(None, Some(p3.as_ref()), None, None)
            .count(),
        200
    );
    assert_eq!(
        store
            .quads_for_pattern(None, None, Some(node("o").as_ref().into()), None)
            .count(),
        1
    );
    let report = session.finish()?;

    assert!(!report.started_empty);
    assert!(report.indexes.is_empty());
    assert!(report.statistics.is_none());
    assert!(matches!(report.statistics_outcome, StatisticsOutcome::Discarded));
    assert!(!dir.path().join(STATISTICS_FILE).exists());
    assert_eq!(store.len()?, 1001);
    store.validate()?;
    Ok(())
}

#[test]
fn test_duplicates_are_not_counted() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let mut quads = triples(100);
    quads.extend(triples(100));
    let report = store
        .bulk_loader()
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(quads.into_iter().map(Ok))?;
    assert_eq!(report.statements, 200);
    assert_eq!(report.tuples_added, 100);
    assert_eq!(report.statistics.map(|summary| summary.total), Some(100));
    assert_eq!(store.len()?, 100);
    Ok(())
}

#[test]
fn test_strategies_give_the_same_store() -> Result<(), Box<dyn Error>> {
    let mut contents = Vec::new();
    for strategy in [
        IndexBuildStrategy::Sequential,
        IndexBuildStrategy::Interleaved,
        IndexBuildStrategy::Parallel,
    ] {
        let store = Store::new()?;
        let report = store
            .bulk_loader()
            .with_strategy(strategy)
            .without_progress()
            .load::<StorageError, Box<dyn Error>, _>(dataset().into_iter().map(Ok))?;
        assert_eq!(report.strategy, strategy);
        assert_eq!(report.indexes.len(), 7);
        store.validate()?;

        let mut patterns = Vec::new();
        let p0 = node("p0");
        let o3 = node("o3");
        let g1 = node("g1");
        for (predicate, object, graph) in [
            (None, None, None),
            (Some(p0.as_ref()), None, None),
            (Some(rdf::TYPE), None, None),
            (None, Some(o3.as_ref().into()), None),
            (None, Some(o3.as_ref().into()), Some(g1.as_ref().into())),
            (Some(p0.as_ref()), None, Some(GraphNameRef::DefaultGraph)),
        ] {
            let mut found = store
                .quads_for_pattern(None, predicate, object, graph)
                .map(|q| q.map(|q| q.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            found.sort();
            patterns.push(found);
        }
        contents.push((sorted_content(&store)?, patterns));
    }
    assert_eq!(contents[0], contents[1]);
    assert_eq!(contents[1], contents[2]);
    assert_eq!(contents[0].0.len(), dataset().len());
    Ok(())
}

#[test]
fn test_progress_does_not_change_the_result() -> Result<(), Box<dyn Error>> {
    let quiet = Store::new()?;
    quiet
        .bulk_loader()
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(dataset().into_iter().map(Ok))?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let verbose = Store::new()?;
    let sink = Arc::clone(&events);
    verbose
        .bulk_loader()
        .with_progress(MonitorOptions::data_phase().with_tick(100, 2))
        .with_index_progress(MonitorOptions::index_phase().with_tick(100, 2))
        .on_progress(move |event: &ProgressEvent| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        })
        .load::<StorageError, Box<dyn Error>, _>(dataset().into_iter().map(Ok))?;

    assert_eq!(sorted_content(&quiet)?, sorted_content(&verbose)?);
    let events = events.lock().map_err(|e| e.to_string())?;
    let data_batches = events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::Batch { label, .. } if &**label == "data"))
        .count();
    assert_eq!(data_batches, dataset().len() / 100);
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::PhaseFinished { label, total, .. } if &**label == "data" && *total == dataset().len() as u64
    )));
    Ok(())
}

#[test]
fn test_interrupted_load_is_recovered() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    {
        let store = Store::open(dir.path())?;
        let mut session = store.bulk_loader().without_progress().start()?;
        session.add_all(&dataset())?;
        drop(session);
        assert_eq!(store.detached_indexes().len(), 7);
        store.flush()?;
    }

    let store = Store::open(dir.path())?;
    let mut detached = store.detached_indexes();
    detached.sort();
    assert_eq!(
        detached,
        [
            "quads_gosp",
            "quads_gpos",
            "quads_ospg",
            "quads_posg",
            "quads_spog",
            "triples_osp",
            "triples_pos"
        ]
    );
    // queries fall back on the primary indexes
    let p0 = node("p0");
    let expected = dataset()
        .iter()
        .filter(|quad| quad.predicate == p0)
        .count();
    assert_eq!(
        store
            .quads_for_pattern(None, Some(p0.as_ref()), None, None)
            .count(),
        expected
    );

    let built = store.rebuild_indexes(IndexBuildStrategy::Parallel)?;
    assert_eq!(built.len(), 7);
    assert!(store.detached_indexes().is_empty());
    store.validate()?;
    assert_eq!(store.len()?, dataset().len());
    drop(store);

    assert!(Store::open(dir.path())?.detached_indexes().is_empty());
    Ok(())
}

#[test]
fn test_reopen_after_load() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let options = StoreOptions::default().with_triple_indexes("SPO", ["OSP"]);
    {
        let store = Store::open_with_options(dir.path(), &options)?;
        store
            .bulk_loader()
            .without_progress()
            .load::<StorageError, Box<dyn Error>, _>(triples(1000).into_iter().map(Ok))?;
    }
    let store = Store::open_with_options(dir.path(), &options)?;
    assert_eq!(store.len()?, 1000);
    assert_eq!(store.triples().secondaries().len(), 1);
    store.validate()?;

    // the layout of a filled table can't change anymore
    drop(store);
    assert!(Store::open(dir.path()).is_err());
    Ok(())
}

fn recorded_events(events: &Arc<Mutex<Vec<ProgressEvent>>>) -> Vec<ProgressEvent> {
    events.lock().map(|events| events.clone()).unwrap_or_default()
}

#[test]
fn test_index_phase_wraps_the_index_builds() -> Result<(), Box<dyn Error>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let store = Store::new()?;
    store
        .bulk_loader()
        .with_target(LoadTarget::DefaultGraph)
        .with_progress(MonitorOptions::disabled())
        .with_index_progress(MonitorOptions::index_phase())
        .on_progress(move |event: &ProgressEvent| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        })
        .load::<StorageError, Box<dyn Error>, _>(triples(1000).into_iter().map(Ok))?;

    let events = recorded_events(&events);
    let position = |expected: &str, started: bool| {
        events.iter().position(|event| match event {
            ProgressEvent::PhaseStarted { label, .. } => started && &**label == expected,
            ProgressEvent::PhaseFinished { label, .. } => !started && &**label == expected,
            _ => false,
        })
    };
    let index_started = position("index", true).ok_or("no index phase start")?;
    let index_finished = position("index", false).ok_or("no index phase end")?;
    for name in ["triples_pos", "triples_osp"] {
        let started = position(name, true).ok_or("no index build start")?;
        let finished = position(name, false).ok_or("no index build end")?;
        assert!(index_started < started && started < finished && finished < index_finished);
    }
    Ok(())
}

#[test]
fn test_incremental_load_keeps_indexes_attached() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let mut session = store
        .bulk_loader()
        .with_incremental(true)
        .without_progress()
        .start()?;
    assert!(session.started_empty());
    assert!(store.detached_indexes().is_empty());
    session.add_all(&dataset())?;
    let p3 = node("p3");
    assert_eq!(
        store
            .quads_for_pattern(None, Some(p3.as_ref()), None, None)
            .count(),
        100
    );
    let report = session.finish()?;

    assert!(report.started_empty);
    assert!(report.indexes.is_empty());
    assert_eq!(store.len()?, dataset().len());
    store.validate()?;
    // the indexes were attached from the start so the statistics are exact
    assert!(matches!(report.statistics_outcome, StatisticsOutcome::Written(_)));
    assert_eq!(
        report.statistics.map(|summary| summary.total),
        Some(dataset().len() as u64)
    );
    Ok(())
}

#[test]
fn test_statistics_can_be_disabled() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let report = store
        .bulk_loader()
        .with_statistics(false)
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(dataset().into_iter().map(Ok))?;

    assert!(report.started_empty);
    assert_eq!(report.indexes.len(), 7);
    assert!(report.statistics.is_none());
    assert!(matches!(report.statistics_outcome, StatisticsOutcome::Discarded));
    assert!(!dir.path().join(STATISTICS_FILE).exists());
    store.validate()?;
    Ok(())
}

#[test]
fn test_panicking_index_worker_leaves_its_index_detached() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let mut session = store
        .bulk_loader()
        .with_target(LoadTarget::DefaultGraph)
        .with_strategy(IndexBuildStrategy::Parallel)
        .with_progress(MonitorOptions::disabled())
        .with_index_progress(MonitorOptions::index_phase())
        .on_progress(|event: &ProgressEvent| {
            if let ProgressEvent::PhaseStarted { label, .. } = event {
                assert_ne!(&**label, "triples_osp", "hook failure");
            }
        })
        .start()?;
    session.add_all(&triples(1000))?;
    match session.finish() {
        Err(LoaderError::IndexBuild { index, .. }) => assert_eq!(index, "triples_osp"),
        other => panic!("the build should have failed on triples_osp, got {other:?}"),
    }
    assert!(store
        .detached_indexes()
        .contains(&"triples_osp".to_owned()));

    store.rebuild_indexes(IndexBuildStrategy::Sequential)?;
    assert!(store.detached_indexes().is_empty());
    store.validate()?;
    assert_eq!(store.len()?, 1000);
    let object = Literal::from(42_i64);
    assert_eq!(
        store
            .quads_for_pattern(None, None, Some(object.as_ref().into()), None)
            .count(),
        1
    );
    Ok(())
}

#[test]
fn test_empty_load_still_creates_the_store_files() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let nothing = Vec::<Result<Quad, StorageError>>::new();
    let report = store
        .bulk_loader()
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(nothing)?;

    assert_eq!(report.statements, 0);
    assert!(report.indexes.is_empty());
    assert!(store.detached_indexes().is_empty());
    for name in [
        "id2str",
        "triples_spo",
        "triples_pos",
        "triples_osp",
        "quads_gspo",
        "quads_gpos",
        "quads_gosp",
        "quads_spog",
        "quads_posg",
        "quads_ospg",
    ] {
        assert!(
            dir.path().join(format!("{name}.cf")).is_file(),
            "{name}.cf is missing"
        );
    }
    drop(store);
    let store = Store::open(dir.path())?;
    assert!(store.is_empty()?);
    assert!(store.detached_indexes().is_empty());
    Ok(())
}

#[test]
fn test_statistics_write_failure_keeps_the_data() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let blocker = dir.path().join(STATISTICS_FILE);
    std::fs::create_dir(&blocker)?;
    std::fs::write(blocker.join("keep"), b"not empty")?;

    let store = Store::open(dir.path())?;
    let report = store
        .bulk_loader()
        .without_progress()
        .load::<StorageError, Box<dyn Error>, _>(dataset().into_iter().map(Ok))?;

    assert!(matches!(report.statistics_outcome, StatisticsOutcome::Failed(_)));
    assert!(report.statistics.is_some());
    assert!(blocker.is_dir());
    assert_eq!(store.len()?, dataset().len());
    assert!(store.detached_indexes().is_empty());
    store.validate()?;
    drop(store);
    assert_eq!(Store::open(dir.path())?.len()?, dataset().len());
    Ok(())
}

fn sorted_matches(
    quads: &[Quad],
    subject: Option<SubjectRef<'_>>,
    predicate: Option<NamedNodeRef<'_>>,
    object: Option<TermRef<'_>>,
    graph_name: Option<GraphNameRef<'_>>,
) -> Vec<String> {
    let mut found = quads
        .iter()
        .filter(|quad| {
            subject.map_or(true, |s| quad.subject.as_ref() == s)
                && predicate.map_or(true, |p| quad.predicate.as_ref() == p)
                && object.map_or(true, |o| quad.object.as_ref() == o)
                && graph_name.map_or(true, |g| quad.graph_name.as_ref() == g)
        })
        .map(|quad| quad.to_string())
        .collect::<Vec<_>>();
    found.sort();
    found
}

#[test]
fn test_every_pattern_matches_a_full_scan() -> Result<(), Box<dyn Error>> {
    let options = StoreOptions::default().with_triple_indexes("SPO", ["POS", "OSP", "PSO"]);
    let mut quads = triples(10_000);
    quads.extend(
        dataset()
            .into_iter()
            .filter(|quad| quad.graph_name != GraphName::DefaultGraph),
    );
    let samples = [
        quads[1234].clone(),
        quads[10_005].clone(),
        quads[quads.len() - 1].clone(),
    ];
    for strategy in [
        IndexBuildStrategy::Sequential,
        IndexBuildStrategy::Interleaved,
        IndexBuildStrategy::Parallel,
    ] {
        let dir = tempfile::tempdir()?;
        let store = Store::open_with_options(dir.path(), &options)?;
        let report = store
            .bulk_loader()
            .with_strategy(strategy)
            .without_progress()
            .load::<StorageError, Box<dyn Error>, _>(quads.clone().into_iter().map(Ok))?;
        assert_eq!(report.indexes.len(), 8, "{strategy}");
        store.validate()?;

        for sample in &samples {
            for mask in 0..16 {
                let subject = (mask & 1 != 0).then(|| sample.subject.as_ref());
                let predicate = (mask & 2 != 0).then(|| sample.predicate.as_ref());
                let object = (mask & 4 != 0).then(|| sample.object.as_ref());
                let graph_name = (mask & 8 != 0).then(|| sample.graph_name.as_ref());
                let mut found = store
                    .quads_for_pattern(subject, predicate, object, graph_name)
                    .map(|q| q.map(|q| q.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                found.sort();
                assert_eq!(
                    found,
                    sorted_matches(&quads, subject, predicate, object, graph_name),
                    "{strategy} with mask {mask:04b} around {sample}"
                );
            }
        }
    }
    Ok(())
}

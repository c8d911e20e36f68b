//! Independent workflows sharing one store without a session manager, as a
//! parallel batch runner does.

use imgforge::{
    CancelToken, CostEntry, Error, Iteration, IterationMetadata, Operation, Session, Store,
};
use std::thread;

fn seed_iteration(store: &Store, session: &Session, prompt: &str) -> Iteration {
    let iteration = Iteration {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        parent_id: None,
        operation: Operation::Generate,
        prompt: prompt.to_string(),
        revised_prompt: None,
        model: "gpt-image-1".into(),
        image_path: String::new(),
        timestamp: imgforge::util::timestamp_now(),
        metadata: IterationMetadata::default(),
    };
    store.create_iteration(&iteration).unwrap();
    iteration
}

#[test]
fn cloned_store_accepts_concurrent_cost_logging() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("imgforge.db")).unwrap();
    let session = Session::new(Some("batch".into()), "gpt-image-1");
    store.create_session(&session).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|n| {
            let store = store.clone();
            let session = session.clone();
            thread::spawn(move || {
                for k in 0..5 {
                    let it = seed_iteration(&store, &session, &format!("worker {n} prompt {k}"));
                    let entry =
                        CostEntry::new(&it.id, &session.id, "openai", &it.model, 0.01, 1);
                    store.log_cost(&entry).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let summary = store.get_session_cost(&session.id).unwrap();
    assert_eq!(summary.entry_count, 40);
    assert_eq!(summary.image_count, 40);
    assert!((summary.total_cost - 0.40).abs() < 1e-9);
    assert_eq!(store.count_iterations(&session.id).unwrap(), 40);
}

#[test]
fn separate_handles_on_one_file_see_each_others_writes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("imgforge.db");
    let writer = Store::open(&path).unwrap();
    let reader = Store::open(&path).unwrap();

    let session = Session::new(None, "gpt-image-1");
    writer.create_session(&session).unwrap();
    let it = seed_iteration(&writer, &session, "shared");
    writer
        .log_cost(&CostEntry::new(&it.id, &session.id, "stability", "sdxl", 0.02, 2))
        .unwrap();

    assert_eq!(reader.get_session(&session.id).unwrap(), session);
    let providers = reader.get_cost_by_provider().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].provider, "stability");
    assert_eq!(providers[0].image_count, 2);
    assert_eq!(reader.stats().unwrap().cost_entries, 1);
}

#[test]
fn cancelling_one_workflow_leaves_others_running() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("imgforge.db")).unwrap();

    let report_token = CancelToken::new();
    let report = store.with_cancel_token(report_token.clone());

    let batch = {
        let store = store.with_cancel_token(CancelToken::new());
        thread::spawn(move || {
            (0..300)
                .map(|n| store.create_session(&Session::new(Some(format!("batch {n}")), "m")))
                .filter(Result::is_err)
                .count()
        })
    };

    let mut report_calls = 0;
    while !batch.is_finished() {
        report_calls += 1;
        if report_calls == 20 {
            report_token.cancel();
        }
        let result = report.list_sessions();
        if report_token.is_cancelled() {
            assert!(matches!(result, Err(Error::Cancelled)));
        }
    }

    assert_eq!(batch.join().unwrap(), 0, "batch writes must not be cancelled");
    assert_eq!(store.stats().unwrap().sessions, 300);

    report_token.cancel();
    assert!(matches!(report.get_total_cost(), Err(Error::Cancelled)));
    assert!(store.get_total_cost().is_ok());
}

#[test]
fn store_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync + Clone>() {}
    assert_send_sync::<Store>();
}

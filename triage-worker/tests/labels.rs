//! Lookup-or-create behavior of the label resolver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FakeMailbox;
use triage::mailbox::{Label, LabelResolver};

#[tokio::test]
async fn test_existing_label_is_reused() {
    let mailbox = FakeMailbox::new();
    mailbox.state.lock().unwrap().labels.push(Label {
        id: "Label_9".to_string(),
        name: "Interested".to_string(),
    });
    let mailbox = Arc::new(mailbox);
    let resolver = LabelResolver::new(mailbox.clone());

    assert_eq!(resolver.resolve("Interested").await.unwrap(), "Label_9");
    assert_eq!(mailbox.state.lock().unwrap().create_label_calls, 0);
}

#[tokio::test]
async fn test_resolved_label_is_cached() {
    let mailbox = Arc::new(FakeMailbox::new());
    let resolver = LabelResolver::new(mailbox.clone());

    let first = resolver.resolve("NotInterested").await.unwrap();
    let second = resolver.resolve("NotInterested").await.unwrap();

    assert_eq!(first, second);
    let state = mailbox.state.lock().unwrap();
    assert_eq!(state.list_labels_calls, 1);
    assert_eq!(state.create_label_calls, 1);
}

#[tokio::test]
async fn test_concurrent_first_use_creates_one_label() {
    let mailbox = FakeMailbox::new();
    mailbox.state.lock().unwrap().create_delay = Some(Duration::from_millis(20));
    let mailbox = Arc::new(mailbox);
    let resolver = Arc::new(LabelResolver::new(mailbox.clone()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve("Interested").await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(mailbox.state.lock().unwrap().create_label_calls, 1);
    assert_eq!(mailbox.label_names(), vec!["Interested".to_string()]);
}

#[tokio::test]
async fn test_create_conflict_falls_back_to_lookup() {
    let mailbox = FakeMailbox::new();
    mailbox.state.lock().unwrap().create_conflicts = true;
    let mailbox = Arc::new(mailbox);
    let resolver = LabelResolver::new(mailbox.clone());

    let id = resolver.resolve("MoreInformation").await.unwrap();

    assert_eq!(id, "Label_1");
    assert_eq!(mailbox.state.lock().unwrap().list_labels_calls, 2);
}

#[tokio::test]
async fn test_deleted_label_is_resolved_again() {
    let mailbox = FakeMailbox::new();
    mailbox.state.lock().unwrap().reject_unknown_labels = true;
    let mailbox = Arc::new(mailbox);
    let resolver = LabelResolver::new(mailbox.clone());
    let unread = vec!["UNREAD".to_string()];

    let first = resolver.apply(&"m1".to_string(), "Interested", &unread).await.unwrap();
    assert_eq!(first, "Label_1");

    // Label deleted in the mailbox; the cached id is now rejected
    mailbox.clear_labels();
    let second = resolver.apply(&"m2".to_string(), "Interested", &unread).await.unwrap();
    assert_eq!(second, "Label_2");
    assert_eq!(mailbox.label_names(), vec!["Interested".to_string()]);

    let state = mailbox.state.lock().unwrap();
    assert_eq!(state.create_label_calls, 2);
    assert_eq!(state.modified.len(), 2);
    assert_eq!(state.modified[1].message, "m2");
}

#[tokio::test]
async fn test_other_modify_failures_keep_the_cache() {
    let mailbox = Arc::new(FakeMailbox::new());
    let resolver = LabelResolver::new(mailbox.clone());
    resolver.resolve("Interested").await.unwrap();

    mailbox.state.lock().unwrap().failing_modifies = 1;
    let result = resolver.apply(&"m1".to_string(), "Interested", &[]).await;
    assert!(result.is_err());

    resolver.resolve("Interested").await.unwrap();
    assert_eq!(mailbox.state.lock().unwrap().list_labels_calls, 1);
}

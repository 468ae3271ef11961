// Message stream tests: paging, live appends and optimistic sends

mod common;
use common::{history, message, setup_logging, AckMode, FakeRecords, RecordingSink};

use anyhow::Result;
use log::info;
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use studyroom::channel::events::names;
use studyroom::models::{MessageStatus, UserRef};
use studyroom::stream::draft::LocalFile;
use studyroom::stream::{MessageStream, PageOutcome, PageSizes, SendOutcome, TEMP_ID_PREFIX};

fn stream_for(records: &Arc<FakeRecords>, sink: &Arc<RecordingSink>) -> MessageStream {
    MessageStream::new(
        "c1",
        UserRef::new("me"),
        records.clone(),
        sink.clone(),
        PageSizes::default(),
    )
}

fn ids(stream: &MessageStream) -> Vec<String> {
    stream.messages().into_iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn test_initial_and_older_pages() -> Result<()> {
    setup_logging();
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 30));
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);

    assert_eq!(stream.open().await, PageOutcome::Loaded { added: 20, has_more: true });
    assert_eq!(stream.messages().first().map(|m| m.id.as_str()), Some("m10"));

    assert_eq!(stream.load_older().await, PageOutcome::Loaded { added: 10, has_more: true });
    let expected: Vec<String> = (0..30).map(|i| format!("m{}", i)).collect();
    assert_eq!(ids(&stream), expected);
    info!("30 messages loaded in ascending order");

    // The next page is empty, after which nothing more is requested.
    assert_eq!(stream.load_older().await, PageOutcome::Loaded { added: 0, has_more: false });
    assert_eq!(stream.load_older().await, PageOutcome::Exhausted);
    assert_eq!(
        records.page_requests(),
        vec![
            ("c1".to_string(), 1, 20),
            ("c1".to_string(), 3, 10),
            ("c1".to_string(), 4, 10),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_short_history_has_no_more() {
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 7));
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));

    assert_eq!(stream.open().await, PageOutcome::Loaded { added: 7, has_more: false });
    assert!(!stream.has_more());
    assert_eq!(stream.load_older().await, PageOutcome::Exhausted);
    assert_eq!(records.page_requests().len(), 1);
}

#[tokio::test]
async fn test_live_message_does_not_duplicate_older_pages() {
    setup_logging();
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 30));
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));
    stream.open().await;

    let live = message("m30", "c1", "partner", "new one", 30);
    records.push_history(live.clone());
    assert!(stream.apply_incoming(&live));
    assert!(!stream.apply_incoming(&live));

    stream.load_older().await;
    stream.load_older().await;

    let loaded = ids(&stream);
    let unique: HashSet<&String> = loaded.iter().collect();
    assert_eq!(unique.len(), loaded.len());
    let expected: Vec<String> = (0..31).map(|i| format!("m{}", i)).collect();
    assert_eq!(loaded, expected);
    assert!(!stream.has_more());
}

#[tokio::test]
async fn test_incoming_for_other_conversation_is_ignored() {
    let records = FakeRecords::new();
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));
    stream.open().await;

    assert!(!stream.apply_incoming(&message("x1", "c2", "partner", "elsewhere", 1)));
    assert!(stream.is_empty());
}

#[tokio::test]
async fn test_send_reconciles_placeholder_in_place() -> Result<()> {
    setup_logging();
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 2));
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);
    stream.open().await;

    // A partner message lands while our send is waiting for its ack,
    // stamped after the canonical message so the list stays ascending.
    let during = stream.clone();
    sink.before_ack(move |canonical| {
        let mut reply = message("p1", "c1", "partner", "meanwhile", 0);
        reply.created_at = canonical.created_at + chrono::Duration::seconds(1);
        during.apply_incoming(&reply);
    });

    let SendOutcome::Sent(canonical) = stream.send("hello", None).await else {
        panic!("expected the send to succeed");
    };
    assert_eq!(canonical.id, "srv-1");
    assert_eq!(ids(&stream), vec!["m0", "m1", "srv-1", "p1"]);
    let messages = stream.messages();
    assert!(messages.windows(2).all(|pair| pair[0].created_at <= pair[1].created_at));
    assert_eq!(stream.get("srv-1").map(|m| m.status), Some(MessageStatus::Sent));
    assert!(stream.messages().iter().all(|m| !m.id.starts_with(TEMP_ID_PREFIX)));

    let sent = sink.emitted_named(names::SEND_MESSAGE);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["conversationId"], "c1");
    assert_eq!(sent[0]["content"], "hello");
    Ok(())
}

#[tokio::test]
async fn test_echo_before_ack_keeps_one_entry() {
    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);
    stream.open().await;

    let echo_target = stream.clone();
    sink.before_ack(move |canonical| {
        assert!(echo_target.apply_incoming(canonical));
    });

    assert!(matches!(stream.send("hi", None).await, SendOutcome::Sent(_)));
    assert_eq!(ids(&stream), vec!["srv-1"]);
}

#[tokio::test]
async fn test_offline_sends_fail_with_distinct_temp_ids() {
    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Offline);
    let stream = stream_for(&records, &sink);
    stream.open().await;

    let first = stream.send("one", None).await;
    let second = stream.send("two", None).await;
    let (SendOutcome::Failed { temp_id: a }, SendOutcome::Failed { temp_id: b }) = (first, second) else {
        panic!("offline sends must fail");
    };
    assert_ne!(a, b);
    assert!(a.starts_with(TEMP_ID_PREFIX));

    let messages = stream.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.status == MessageStatus::Failed));
    assert_eq!(messages[0].content, "one");
}

#[tokio::test]
async fn test_rejected_ack_marks_failed() {
    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Reject);
    let stream = stream_for(&records, &sink);

    let SendOutcome::Failed { temp_id } = stream.send("hi", None).await else {
        panic!("rejected send must fail");
    };
    assert_eq!(stream.get(&temp_id).map(|m| m.status), Some(MessageStatus::Failed));
}

#[tokio::test]
async fn test_resend_replaces_failed_entry() {
    setup_logging();
    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Offline);
    let stream = stream_for(&records, &sink);
    stream.open().await;

    let SendOutcome::Failed { temp_id } = stream.send("retry me", None).await else {
        panic!("offline send must fail");
    };
    assert!(stream.resend("no-such-id").await.is_none());

    sink.set_mode(AckMode::Accept);
    let outcome = stream.resend(&temp_id).await;
    assert!(matches!(outcome, Some(SendOutcome::Sent(ref m)) if m.content == "retry me"));
    assert!(stream.get(&temp_id).is_none());
    assert_eq!(stream.len(), 1);
    assert!(stream.messages()[0].is_confirmed());

    // Only failed entries can be resent.
    assert!(stream.resend("srv-1").await.is_none());
}

#[tokio::test]
async fn test_empty_send_is_rejected() {
    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);

    assert_eq!(stream.send("   ", None).await, SendOutcome::Rejected);
    assert!(stream.is_empty());
    assert!(sink.emitted().is_empty());
}

#[tokio::test]
async fn test_attachment_upload() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"%PDF-1.4")?;
    let local = LocalFile::from_path(file.path())?;

    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);

    let SendOutcome::Sent(canonical) = stream.send("", Some(local.clone())).await else {
        panic!("upload then send should succeed");
    };
    assert_eq!(canonical.attachments.len(), 1);
    assert_eq!(canonical.attachments[0].original_name, local.file_name);

    // Failed upload: nothing reaches the channel and the entry is marked failed.
    records.fail_upload.store(true, Ordering::SeqCst);
    let SendOutcome::Failed { temp_id } = stream.send("with file", Some(local)).await else {
        panic!("failed upload must fail the send");
    };
    assert_eq!(stream.get(&temp_id).map(|m| m.status), Some(MessageStatus::Failed));
    assert_eq!(sink.emitted_named(names::SEND_MESSAGE).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_resend_uploads_the_file_again() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"week 3 notes")?;
    let local = LocalFile::from_path(file.path())?;

    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);

    records.fail_upload.store(true, Ordering::SeqCst);
    let SendOutcome::Failed { temp_id } = stream.send("", Some(local.clone())).await else {
        panic!("failed upload must fail the send");
    };
    assert!(sink.emitted_named(names::SEND_MESSAGE).is_empty());

    records.fail_upload.store(false, Ordering::SeqCst);
    let Some(SendOutcome::Sent(canonical)) = stream.resend(&temp_id).await else {
        panic!("retry with a working upload should succeed");
    };
    assert_eq!(canonical.attachments.len(), 1);
    assert_eq!(canonical.attachments[0].original_name, local.file_name);
    assert_eq!(ids(&stream), vec![canonical.id.clone()]);

    let sent = sink.emitted_named(names::SEND_MESSAGE);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["attachments"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_resend_after_second_upload_failure_keeps_the_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"slides")?;
    let local = LocalFile::from_path(file.path())?;

    let records = FakeRecords::new();
    let sink = RecordingSink::new("me", AckMode::Accept);
    let stream = stream_for(&records, &sink);

    records.fail_upload.store(true, Ordering::SeqCst);
    let SendOutcome::Failed { temp_id: first } = stream.send("see attached", Some(local)).await else {
        panic!("failed upload must fail the send");
    };
    let Some(SendOutcome::Failed { temp_id: second }) = stream.resend(&first).await else {
        panic!("upload still failing");
    };
    assert_ne!(first, second);
    assert_eq!(stream.len(), 1);

    records.fail_upload.store(false, Ordering::SeqCst);
    let Some(SendOutcome::Sent(canonical)) = stream.resend(&second).await else {
        panic!("third attempt should go through");
    };
    assert_eq!(canonical.content, "see attached");
    assert_eq!(canonical.attachments.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_response_after_close_is_discarded() {
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 5));
    records.set_fetch_delay(Some(Duration::from_millis(300)));
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));

    let (outcome, _) = tokio::join!(stream.open(), async { stream.close() });
    assert_eq!(outcome, PageOutcome::Stale);
    assert!(stream.is_empty());
    assert!(!stream.is_loading());
}

#[tokio::test(start_paused = true)]
async fn test_older_fetch_waits_for_first_page() {
    let records = FakeRecords::new();
    records.set_history("c1", history("c1", 25));
    records.set_fetch_delay(Some(Duration::from_millis(300)));
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));

    let (first, older) = tokio::join!(stream.open(), stream.load_older());
    assert_eq!(first, PageOutcome::Loaded { added: 20, has_more: true });
    assert_eq!(older, PageOutcome::Busy);
}

#[tokio::test]
async fn test_failed_first_page() {
    let records = FakeRecords::new();
    records.fail_messages.store(true, Ordering::SeqCst);
    let stream = stream_for(&records, &RecordingSink::new("me", AckMode::Accept));

    assert_eq!(stream.open().await, PageOutcome::Failed);
    assert!(stream.is_empty());
    assert!(!stream.is_loading());
}

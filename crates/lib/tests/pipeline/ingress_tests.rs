use lamina_lib::engine::{Accepted, ProcessOutcome};

use super::common::{Outcome, RoutePlatform, TestPipeline, build_event, queued};

#[tokio::test]
async fn redelivered_event_is_skipped() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let first = pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  queued(&first);

  let second = pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  assert_eq!(second, ProcessOutcome::SkippedDuplicate);
  assert_eq!(pipeline.engine.registry().stats().workers, 2);
}

#[tokio::test]
async fn concurrent_delivery_creates_one_job() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let event = build_event("evt-1", "acme", "p1");
  let (a, b) = tokio::join!(pipeline.engine.process(&event), pipeline.engine.process(&event));

  let labels = [a.label(), b.label()];
  assert!(labels.contains(&"accepted"));
  assert!(labels.contains(&"skipped-duplicate"));
  let all = pipeline.engine.registry().list(&Default::default()).unwrap();
  assert_eq!(all.items.len(), 1);
}

#[tokio::test]
async fn missing_source_can_be_redelivered_after_upload() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());

  let outcome = pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  assert_eq!(outcome.label(), "rejected-invalid");
  assert!(outcome.acknowledge());

  pipeline.sources.insert("p1", "module.exports = (e) => e;");
  let retried = pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  queued(&retried);
}

#[tokio::test]
async fn unchanged_source_reuses_running_build() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let (job_id, hash) = queued(&pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await);
  let second = pipeline.engine.process(&build_event("evt-2", "acme", "p1")).await;

  let ProcessOutcome::Accepted(Accepted::BuildReused {
    job_id: reused,
    content_hash,
    ..
  }) = &second
  else {
    panic!("expected the running build to be reused, got {:?}", second);
  };
  assert_eq!(*reused, job_id);
  assert_eq!(content_hash.0, hash);
  assert_eq!(pipeline.staging.put_count(), 1);
  let all = pipeline.engine.registry().list(&Default::default()).unwrap();
  assert_eq!(all.items.len(), 1);
}

#[tokio::test]
async fn changed_source_changes_content_hash() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");
  let (_, first) = queued(&pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await);

  pipeline.sources.insert("p1", "module.exports = (e) => [e];");
  let (_, second) = queued(&pipeline.engine.process(&build_event("evt-2", "acme", "p1")).await);

  assert_ne!(first, second);
  assert_eq!(pipeline.staging.put_count(), 2);
}

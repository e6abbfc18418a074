use lamina_lib::dispatch::JobStatus;
use lamina_lib::provision::{Descriptor, ResourceKind, ResourceName};

use super::common::{Outcome, RoutePlatform, TestPipeline, build_event, eventually, queued};

const NAME: &str = "lambda-acme-p1";

#[tokio::test]
async fn successful_build_is_deployed() {
  let pipeline = TestPipeline::new(Outcome::Succeed, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let (job_id, hash) = queued(&pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await);
  let platform = pipeline.platform.clone();
  eventually(|| platform.inner.len() == 4).await;

  let job = pipeline.engine.registry().get(&job_id).unwrap().job;
  assert_eq!(job.status, JobStatus::Succeeded);

  let service = pipeline.platform.inner.resource(ResourceKind::Service, NAME).unwrap();
  let Descriptor::Service(service) = service.descriptor else {
    panic!("expected a service descriptor");
  };
  assert!(service.image.ends_with(&format!(":{}", &hash[..12])));
  assert_eq!(service.config, format!("{}-config", NAME));

  let route = pipeline.platform.inner.resource(ResourceKind::Route, NAME).unwrap();
  let Descriptor::Route(route) = route.descriptor else {
    panic!("expected a route descriptor");
  };
  assert_eq!(route.filter.source, "network.notifi.acme");
  assert_eq!(route.filter.subject, "p1");
  assert_eq!(route.filter.event_type, "network.notifi.lambda.parser.start");
}

#[tokio::test]
async fn route_failures_are_retried() {
  let pipeline = TestPipeline::new(Outcome::Succeed, RoutePlatform::failing_routes(2));
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  let platform = pipeline.platform.clone();
  eventually(|| platform.inner.resource(ResourceKind::Route, NAME).is_some()).await;

  let service = pipeline.platform.inner.resource(ResourceKind::Service, NAME).unwrap();
  assert_eq!(service.resource_version, 1);
}

#[tokio::test]
async fn failed_build_deploys_nothing() {
  let pipeline = TestPipeline::new(Outcome::Fail, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let (job_id, _) = queued(&pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await);
  let registry = pipeline.engine.registry();
  eventually(|| registry.get(&job_id).unwrap().job.status == JobStatus::Failed).await;

  let job = registry.get(&job_id).unwrap().job;
  assert!(job.error.unwrap().contains("compile error"));
  assert!(pipeline.platform.inner.is_empty());
}

#[tokio::test]
async fn cancelled_build_deploys_nothing() {
  let pipeline = TestPipeline::new(Outcome::Hang, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let (job_id, _) = queued(&pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await);
  let registry = pipeline.engine.registry();
  eventually(|| registry.get(&job_id).unwrap().job.status == JobStatus::Running).await;

  registry.cancel(&job_id).unwrap();
  eventually(|| registry.get(&job_id).unwrap().job.status == JobStatus::Cancelled).await;
  assert!(pipeline.platform.inner.is_empty());
}

#[tokio::test]
async fn new_source_rolls_service_forward() {
  let pipeline = TestPipeline::new(Outcome::Succeed, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");
  pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  let platform = pipeline.platform.clone();
  eventually(|| platform.inner.len() == 4).await;

  pipeline.sources.insert("p1", "module.exports = (e) => [e];");
  let (_, hash) = queued(&pipeline.engine.process(&build_event("evt-2", "acme", "p1")).await);
  let tag = format!(":{}", &hash[..12]);
  eventually(|| {
    matches!(
      platform.inner.resource(ResourceKind::Service, NAME).map(|s| s.descriptor),
      Some(Descriptor::Service(ref s)) if s.image.ends_with(&tag)
    )
  })
  .await;
  assert_eq!(platform.inner.len(), 4);
}

#[tokio::test]
async fn deprovision_removes_everything() {
  let pipeline = TestPipeline::new(Outcome::Succeed, RoutePlatform::default());
  pipeline.sources.insert("p1", "module.exports = (e) => e;");
  pipeline.engine.process(&build_event("evt-1", "acme", "p1")).await;
  let platform = pipeline.platform.clone();
  eventually(|| platform.inner.len() == 4).await;

  let name = ResourceName::parse(NAME).unwrap();
  let report = pipeline.engine.deprovision(&name).await.unwrap();
  assert_eq!(report.removed.len(), 4);
  assert!(pipeline.platform.inner.is_empty());

  pipeline.engine.shutdown().await;
}

#[tokio::test]
async fn long_ids_are_deployed() {
  let pipeline = TestPipeline::new(Outcome::Succeed, RoutePlatform::default());
  let tenant = "t".repeat(70);
  pipeline.sources.insert("p1", "module.exports = (e) => e;");

  let (job_id, _) = queued(&pipeline.engine.process(&build_event("evt-1", &tenant, "p1")).await);
  let platform = pipeline.platform.clone();
  eventually(|| platform.inner.len() == 4).await;

  let job = pipeline.engine.registry().get(&job_id).unwrap().job;
  let route = platform.inner.resource(ResourceKind::Route, job.resource_name.as_str()).unwrap();
  let Descriptor::Route(route) = route.descriptor else {
    panic!("expected a route descriptor");
  };
  assert_eq!(route.filter.source, format!("network.notifi.{}", tenant));
}

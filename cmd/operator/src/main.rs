use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{get, post, web::Data, web::Json, App, HttpRequest, HttpResponse, HttpServer, Responder};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use kube::runtime::watcher;
use kube::{Api, Config};

use clap::{crate_authors, crate_description, crate_version, Parser};

use gitmirror_k8s_util::client::new_client_with_metrics;
use gitmirror_operator::admission::{self, AdmissionContext, AdmissionRequest};
use gitmirror_operator::correlation::CorrelationStore;
use gitmirror_operator::destination::DestinationResolver;
use gitmirror_operator::dispatcher::Dispatcher;
use gitmirror_operator::event::{Operation, UserInfo};
use gitmirror_operator::leader::LeaderArbiter;
use gitmirror_operator::metrics::{DestinationLabel, Metrics};
use gitmirror_operator::queue::EventQueue;
use gitmirror_operator::reconcilers::{git_provider, git_target, rule, Context as ReconcilerContext};
use gitmirror_operator::rules::RuleStore;
use gitmirror_operator::telemetry;
use gitmirror_operator::worker::HealthSink;

#[derive(Parser, Debug)]
#[command(
    name = "gitmirror-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Port the admission webhook listens on.
    #[arg(long, default_value_t = 8443, env)]
    webhook_port: u32,

    /// Port `/metrics` and `/healthz` are served on.
    #[arg(long, default_value_t = 8080, env)]
    metrics_port: u32,

    /// TLS certificate for the admission webhook.
    #[arg(long, env)]
    tls_cert_path: Option<String>,

    /// TLS private key for the admission webhook.
    #[arg(long, env)]
    tls_key_path: Option<String>,

    /// Whether to defer to an external leader elector's signal before
    /// running commit workers and the watch-side ingester. Absent an
    /// elector, the process should behave as if it won an election, so
    /// this defaults to `false`; deployments that wire an actual elector
    /// pass `--leader-election=true` to start demoted until it reports in.
    #[arg(long, default_value_t = false, env)]
    leader_election: bool,

    #[arg(long, default_value_t = 60, env)]
    correlation_ttl_secs: u64,

    #[arg(long, default_value_t = 10000, env)]
    correlation_max_entries: usize,

    #[arg(long, default_value_t = 10, env)]
    correlation_max_queue_depth: usize,

    /// Directory commit workers clone repositories into.
    #[arg(long, default_value = "/var/lib/gitmirror-operator/clones", env)]
    clone_dir: String,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,gitmirror_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format.
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. If not provided,
    /// tracing is disabled.
    #[arg(long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    #[arg(long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[get("/healthz")]
async fn healthz(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/metrics")]
async fn metrics_endpoint(metrics: Data<Metrics>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics.encode())
}

/// HTTP transport for the admission webhook: decodes the
/// `AdmissionReview` envelope and delegates to `admission::review`, the
/// transport-agnostic core, then always answers "allowed".
#[post("/validate")]
async fn validate(
    ctx: Data<Arc<AdmissionContext>>,
    metrics: Data<Metrics>,
    body: Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let review = body.into_inner();
    let Some(request) = review.request else {
        return HttpResponse::BadRequest().body("missing admission request");
    };

    let operation = match request.operation.as_str() {
        "CREATE" => Operation::Create,
        "UPDATE" => Operation::Update,
        "DELETE" => Operation::Delete,
        other => {
            tracing::warn!(operation = other, "admission request with unrecognized operation, allowing");
            let response = AdmissionResponse::from(&request).into_review();
            return HttpResponse::Ok().json(response);
        }
    };

    let object = request
        .object
        .as_ref()
        .or(request.old_object.as_ref())
        .and_then(|o| serde_json::to_value(o).ok())
        .unwrap_or(serde_json::Value::Null);

    let req = AdmissionRequest {
        group: request.resource.group.clone(),
        version: request.resource.version.clone(),
        resource: request.resource.resource.clone(),
        namespace: request.namespace.clone(),
        name: request.name.clone(),
        operation,
        user_info: UserInfo {
            username: request.user_info.username.clone().unwrap_or_default(),
            uid: request.user_info.uid.clone().unwrap_or_default(),
        },
        object,
        namespace_labels: BTreeMap::new(),
    };

    metrics.admission_requests_total.inc();
    let response = AdmissionResponse::from(&request);
    match admission::review(&ctx, req).await {
        Ok(outcome) => {
            metrics.admission_matched_rules.observe(outcome.matched_rule_count as f64);
        }
        Err(e) => {
            tracing::error!(error = %e, "admission review failed; allowing per observational-only policy");
        }
    }
    HttpResponse::Ok().json(response.into_review())
}

/// Mirrors a `GitTarget`'s Ready condition into `destination_ready` and
/// reflects push-failure/backoff into the same gauge, the ambient
/// counterpart to `worker::HealthSink`'s status-subresource sibling.
struct MetricsHealthSink {
    metrics: Metrics,
}

impl HealthSink for MetricsHealthSink {
    fn set_degraded(&self, destination_key: &str, message: &str) {
        tracing::warn!(destination = destination_key, message, "commit worker degraded");
        self.metrics
            .destination_ready
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .set(0);
        self.metrics
            .commit_push_failures_total
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .inc();
    }

    fn set_healthy(&self, destination_key: &str) {
        self.metrics
            .destination_ready
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .set(1);
        self.metrics
            .commits_total
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .inc();
    }

    fn set_queue_depth(&self, destination_key: &str, depth: usize) {
        self.metrics
            .worker_queue_depth
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .set(depth as i64);
    }

    fn record_conflict(&self, destination_key: &str) {
        self.metrics
            .commit_push_conflicts_total
            .get_or_create(&DestinationLabel { destination: destination_key.to_owned() })
            .inc();
    }
}

/// Keeps a namespace-label cache fresh off a plain informer, so the
/// watch-side ingester's per-event namespace-label lookup (needed for
/// `namespaceSelector` matching) stays synchronous.
async fn run_namespace_label_cache(client: kube::Client, cache: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>) {
    let api: Api<Namespace> = Api::all(client);
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        let Ok(event) = event else { continue };
        match event {
            watcher::Event::Apply(ns) => {
                let name = ns.metadata.name.clone().unwrap_or_default();
                let labels = ns.metadata.labels.clone().unwrap_or_default();
                cache.lock().unwrap().insert(name, labels);
            }
            watcher::Event::Delete(ns) => {
                if let Some(name) = ns.metadata.name.clone() {
                    cache.lock().unwrap().remove(&name);
                }
            }
            watcher::Event::Init | watcher::Event::InitApply(_) | watcher::Event::InitDone => {}
        }
    }
}

/// Discovers every API resource the cluster serves and spawns a watcher
/// for each under the watch-side ingestion path. Rediscovery isn't wired
/// to rule-store changes; a process restart picks up newly-registered
/// CRDs, which matches how the admission webhook itself needs a
/// `ValidatingWebhookConfiguration` update (an external step it has no
/// control over) to observe a new resource type anyway.
async fn spawn_watchers(
    client: kube::Client,
    watch_ctx: Arc<gitmirror_operator::watch::WatchContext>,
    leader: Arc<LeaderArbiter>,
    namespace_labels: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
) {
    let discovery = match kube::discovery::Discovery::new(client.clone()).run().await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "API discovery failed; watch-side ingestion disabled");
            return;
        }
    };

    for group in discovery.groups() {
        for (api_resource, _caps) in group.recommended_resources() {
            let client = client.clone();
            let watch_ctx = watch_ctx.clone();
            let leader = leader.clone();
            let namespace_labels = namespace_labels.clone();
            let lookup: Arc<dyn Fn(&str) -> BTreeMap<String, String> + Send + Sync> =
                Arc::new(move |namespace: &str| namespace_labels.lock().unwrap().get(namespace).cloned().unwrap_or_default());
            tokio::spawn(async move {
                gitmirror_operator::watch::run_for_gvr(client, api_resource, lookup, watch_ctx, leader).await;
            });
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format, args.tracing_url.as_deref(), args.sample_ratio).await?;

    let mut registry = prometheus_client::registry::Registry::with_prefix("gitmirror_client");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;

    let metrics = Metrics::default();
    let rule_store = Arc::new(RuleStore::new());
    let correlation_store = Arc::new(CorrelationStore::new(
        Duration::from_secs(args.correlation_ttl_secs),
        args.correlation_max_entries,
        args.correlation_max_queue_depth,
    ));
    let (event_queue, event_queue_rx) = EventQueue::new();
    let leader = Arc::new(LeaderArbiter::new(!args.leader_election));

    let admission_ctx = Arc::new(AdmissionContext {
        rule_store: rule_store.clone(),
        correlation_store: correlation_store.clone(),
        event_queue: event_queue.clone(),
        leader: leader.clone(),
    });

    let watch_ctx = Arc::new(gitmirror_operator::watch::WatchContext {
        rule_store: rule_store.clone(),
        correlation_store: correlation_store.clone(),
        event_queue: event_queue.clone(),
        metrics: Some(metrics.clone()),
    });

    let resolver = Arc::new(DestinationResolver::new(client.clone()));
    let health_sink: Arc<dyn HealthSink> = Arc::new(MetricsHealthSink { metrics: metrics.clone() });
    let dispatcher = Dispatcher::new(client.clone(), resolver, PathBuf::from(&args.clone_dir), leader.clone())
        .with_health_sink(health_sink)
        .with_metrics(metrics.clone());

    let reconciler_ctx = Arc::new(ReconcilerContext {
        client: client.clone(),
        rule_store: rule_store.clone(),
    });

    let namespace_labels = Arc::new(Mutex::new(BTreeMap::new()));

    let dispatcher_task = tokio::spawn(dispatcher.run(event_queue_rx));
    let namespace_cache_task = tokio::spawn(run_namespace_label_cache(client.clone(), namespace_labels.clone()));
    let watch_task = tokio::spawn(spawn_watchers(client.clone(), watch_ctx, leader.clone(), namespace_labels));
    let watch_rule_task = tokio::spawn(rule::run_watch_rule(reconciler_ctx.clone()));
    let cluster_watch_rule_task = tokio::spawn(rule::run_cluster_watch_rule(reconciler_ctx.clone()));
    let git_provider_task = tokio::spawn(git_provider::run(reconciler_ctx.clone()));
    let git_target_task = tokio::spawn(git_target::run(reconciler_ctx));

    let eviction_correlation_store = correlation_store.clone();
    let eviction_rule_store = rule_store.clone();
    let eviction_metrics = metrics.clone();
    let eviction_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            eviction_correlation_store.evict_expired();
            eviction_metrics.record_evictions(&eviction_correlation_store.drain_evictions());
            eviction_metrics.correlation_size.set(eviction_correlation_store.size() as i64);
            for (namespace, count) in eviction_rule_store.count_by_namespace() {
                eviction_metrics.rules_total.get_or_create(&gitmirror_operator::metrics::NamespaceLabel { namespace }).set(count as i64);
            }
        }
    });

    let webhook_metrics = metrics.clone();
    let webhook_admission_ctx = admission_ctx.clone();
    let webhook_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(webhook_admission_ctx.clone()))
            .app_data(Data::new(webhook_metrics.clone()))
            .service(validate)
    });
    let webhook_server = match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(_), Some(_)) => {
            tracing::warn!("TLS material configured but admission webhook TLS termination is out of scope; serving plaintext");
            webhook_server.bind(format!("0.0.0.0:{}", args.webhook_port))?
        }
        _ => webhook_server.bind(format!("0.0.0.0:{}", args.webhook_port))?,
    }
    .shutdown_timeout(5);

    let metrics_for_server = metrics.clone();
    let metrics_server = HttpServer::new(move || App::new().app_data(Data::new(metrics_for_server.clone())).service(healthz).service(metrics_endpoint))
        .bind(format!("0.0.0.0:{}", args.metrics_port))?
        .shutdown_timeout(5);

    let (webhook_result, metrics_result) = tokio::join!(webhook_server.run(), metrics_server.run());
    webhook_result?;
    metrics_result?;

    dispatcher_task.abort();
    namespace_cache_task.abort();
    watch_task.abort();
    watch_rule_task.abort();
    cluster_watch_rule_task.abort();
    git_provider_task.abort();
    git_target_task.abort();
    eviction_task.abort();

    Ok(())
}

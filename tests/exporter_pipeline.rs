use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;

use spark_app_exporter::agent::Agent;
use spark_app_exporter::aggregator::Aggregator;
use spark_app_exporter::clock::{Clock, FixedClock};
use spark_app_exporter::config::{Config, ExporterConfig, HistoryConfig, YarnConfig};
use spark_app_exporter::export::{ErrorSource, Publisher};
use spark_app_exporter::{history, yarn};

const NOW_MS: i64 = 1_700_000_060_000;
const STARTED_MS: i64 = 1_700_000_000_000;

fn app_json(id: &str, name: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "user": "hadoop",
        "queue": "default",
        "state": "RUNNING",
        "allocatedMB": 4096,
        "reservedMB": 0,
        "allocatedVCores": 3,
        "reservedVCores": 0,
        "runningContainers": 3,
        "startedTime": STARTED_MS,
        "finishedTime": 0,
        "progress": 10.0,
        "trackingUrl": format!(
            "http://ip-10-0-0-1.ec2.internal:20888/proxy/{id}/"
        ),
        "applicationType": "SPARK",
        "finalStatus": "UNDEFINED"
    })
}

fn config(yarn_url: &str, history_urls: Vec<String>) -> Config {
    Config {
        log_level: "info".to_string(),
        yarn: YarnConfig {
            endpoint: yarn_url.to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        history: HistoryConfig {
            endpoints: history_urls,
            timeout: Duration::from_secs(1),
            ..Default::default()
        },
        exporter: ExporterConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        scrape_interval: Duration::from_secs(3600),
    }
}

async fn mock_apps(server: &mut ServerGuard, body: serde_json::Value) -> Mock {
    server
        .mock("GET", "/ws/v1/cluster/apps")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("states".into(), "RUNNING,SUBMITTED,ACCEPTED".into()),
            Matcher::UrlEncoded("applicationTypes".into(), "SPARK".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await
}

async fn mock_executors(server: &mut ServerGuard, app_id: &str, body: serde_json::Value) -> Mock {
    server
        .mock(
            "GET",
            format!("/api/v1/applications/{app_id}/executors").as_str(),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await
}

fn lines_for<'a>(text: &'a str, metric: &str) -> Vec<&'a str> {
    let prefix = format!("{metric}{{");
    text.lines().filter(|l| l.starts_with(&prefix)).collect()
}

fn aggregator(
    cfg: &Config,
    publisher: &Arc<Publisher>,
) -> Aggregator<yarn::Client, history::Client> {
    let inventory = yarn::Client::new(cfg)
        .expect("yarn client")
        .with_metrics(publisher.request_metrics())
        .with_error_counter(publisher.error_counter(ErrorSource::Inventory));
    let resolver = history::Client::new(cfg)
        .expect("history client")
        .with_metrics(publisher.request_metrics());

    Aggregator::new(
        inventory,
        resolver,
        Arc::new(FixedClock::new(NOW_MS)) as Arc<dyn Clock>,
        Arc::clone(publisher),
    )
}

#[tokio::test]
async fn test_full_cycle_two_jobs_one_with_executors() {
    let mut rm = Server::new_async().await;
    let mut spark = Server::new_async().await;

    let apps = mock_apps(
        &mut rm,
        json!({"apps": {"app": [
            app_json("application_1_0001", "etl j-ABCDEFGHIJKLM"),
            app_json("application_1_0002", "adhoc"),
        ]}}),
    )
    .await;
    let executors = mock_executors(
        &mut spark,
        "application_1_0001",
        json!([
            {"id": "driver", "hostPort": "10.0.0.5:38000", "memoryUsed": 1048576,
             "totalCores": 0, "totalTasks": 0},
            {"id": "1", "hostPort": "10.0.0.6:38001", "memoryUsed": 3145728,
             "totalCores": 4, "totalTasks": 17}
        ]),
    )
    .await;
    let detail = spark
        .mock("GET", "/api/v1/applications/application_1_0001")
        .with_status(200)
        .with_body(
            json!({
                "id": "application_1_0001",
                "name": "etl",
                "attempts": [{"attemptId": "1", "appSparkVersion": "3.5.0", "completed": false}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    // First candidate refuses connections, so every lookup falls through.
    let cfg = config(
        &rm.url(),
        vec!["http://127.0.0.1:9".to_string(), spark.url()],
    );
    let publisher = Arc::new(Publisher::new(&cfg.exporter.addr).expect("publisher"));
    let agg = aggregator(&cfg, &publisher);

    let snapshot = agg.run_cycle().await;

    apps.assert_async().await;
    executors.assert_async().await;
    detail.assert_async().await;

    assert_eq!(snapshot.job_count(), 2);
    assert_eq!(snapshot.worker_count(), 2);
    assert_eq!(publisher.apps_scraped.get(), 2.0);
    assert_eq!(publisher.cycles_total.get(), 1.0);
    for source in ErrorSource::ALL {
        assert_eq!(publisher.error_count(source), 0.0, "{}", source.as_str());
    }

    let text = publisher.render().expect("render");

    let memory = lines_for(&text, "spark_application_memory_used_mb");
    assert_eq!(memory.len(), 2);
    assert!(memory.iter().all(|l| l.ends_with(" 4096")));

    let duration = lines_for(&text, "spark_application_duration_seconds");
    assert_eq!(duration.len(), 2);
    assert!(duration.iter().all(|l| l.ends_with(" 60")));

    let first = lines_for(&text, "spark_application_vcores_used")
        .into_iter()
        .find(|l| l.contains("app_id=\"application_1_0001\""))
        .expect("vcores series for first job");
    assert!(first.contains("cluster_id=\"j-ABCDEFGHIJKLM\""));

    let exec_mem = lines_for(&text, "spark_executor_memory_used_mb");
    assert_eq!(exec_mem.len(), 2);
    assert!(exec_mem
        .iter()
        .any(|l| l.contains("host=\"10.0.0.6\"") && l.ends_with(" 3")));
    assert!(exec_mem
        .iter()
        .all(|l| l.contains("app_id=\"application_1_0001\"")));

    let info = lines_for(&text, "spark_application_info");
    assert_eq!(info.len(), 2);
    assert!(info
        .iter()
        .any(|l| l.contains("spark_version=\"3.5.0\"")));

    assert!(text.contains("spark_exporter_apps_scraped_total 2"));
    assert!(text.contains("spark_exporter_upstream_requests_total{status=\"transport\",upstream=\"history\"}"));
}

#[tokio::test]
async fn test_single_app_object_is_accepted() {
    let mut rm = Server::new_async().await;
    let spark = Server::new_async().await;

    let _apps = mock_apps(
        &mut rm,
        json!({"apps": {"app": app_json("application_1_0007", "solo")}}),
    )
    .await;

    let cfg = config(&rm.url(), vec![spark.url()]);
    let publisher = Arc::new(Publisher::new(&cfg.exporter.addr).expect("publisher"));
    let snapshot = aggregator(&cfg, &publisher).run_cycle().await;

    assert_eq!(snapshot.job_count(), 1);
    let entry = snapshot.job("application_1_0007").expect("job");
    assert!(entry.workers.is_empty());
    assert!(entry.detail.is_none());
    assert_eq!(entry.job.group_id, "unknown");
}

#[tokio::test]
async fn test_malformed_sibling_does_not_block_others() {
    let mut rm = Server::new_async().await;
    let spark = Server::new_async().await;

    let mut broken = app_json("application_1_0003", "broken");
    broken["allocatedMB"] = json!({"not": "a number"});

    let _apps = mock_apps(
        &mut rm,
        json!({"apps": {"app": [
            app_json("application_1_0001", "a"),
            broken,
            app_json("application_1_0002", "b"),
        ]}}),
    )
    .await;

    let cfg = config(&rm.url(), vec![spark.url()]);
    let publisher = Arc::new(Publisher::new(&cfg.exporter.addr).expect("publisher"));
    let snapshot = aggregator(&cfg, &publisher).run_cycle().await;

    assert_eq!(snapshot.job_count(), 2);
    assert!(snapshot.job("application_1_0003").is_none());
    assert_eq!(publisher.error_count(ErrorSource::Processing), 1.0);
    assert_eq!(publisher.apps_scraped.get(), 2.0);
}

#[tokio::test]
async fn test_malformed_executor_is_processing_error() {
    let mut rm = Server::new_async().await;
    let mut spark = Server::new_async().await;

    let _apps = mock_apps(
        &mut rm,
        json!({"apps": {"app": [
            app_json("application_1_0001", "mixed"),
            app_json("application_1_0002", "clean"),
        ]}}),
    )
    .await;
    let _bad = mock_executors(
        &mut spark,
        "application_1_0001",
        json!([
            {"id": "1", "hostPort": "10.0.0.5:38000", "memoryUsed": 1048576,
             "totalCores": 4, "totalTasks": 1},
            {"id": "2", "hostPort": "10.0.0.6:38000", "memoryUsed": "oops",
             "totalCores": 4, "totalTasks": 1}
        ]),
    )
    .await;
    let _good = mock_executors(
        &mut spark,
        "application_1_0002",
        json!([{"id": "1", "hostPort": "10.0.0.7:38000", "memoryUsed": 0,
                "totalCores": 2, "totalTasks": 0}]),
    )
    .await;

    let cfg = config(&rm.url(), vec![spark.url()]);
    let publisher = Arc::new(Publisher::new(&cfg.exporter.addr).expect("publisher"));
    let snapshot = aggregator(&cfg, &publisher).run_cycle().await;

    assert!(snapshot.job("application_1_0001").is_none());
    assert_eq!(snapshot.job_count(), 1);
    assert_eq!(snapshot.worker_count(), 1);
    assert_eq!(publisher.error_count(ErrorSource::Processing), 1.0);
    assert_eq!(publisher.apps_scraped.get(), 1.0);
}

#[tokio::test]
async fn test_inventory_outage_publishes_empty_snapshot() {
    let mut rm = Server::new_async().await;
    let spark = Server::new_async().await;

    let _down = rm
        .mock("GET", "/ws/v1/cluster/apps")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let cfg = config(&rm.url(), vec![spark.url()]);
    let publisher = Arc::new(Publisher::new(&cfg.exporter.addr).expect("publisher"));
    let snapshot = aggregator(&cfg, &publisher).run_cycle().await;

    assert!(snapshot.is_empty());
    assert_eq!(publisher.error_count(ErrorSource::Inventory), 1.0);
    assert_eq!(publisher.apps_scraped.get(), 0.0);

    let text = publisher.render().expect("render");
    assert!(lines_for(&text, "spark_application_memory_used_mb").is_empty());
    assert!(text.contains("spark_exporter_scrape_errors_total{source=\"inventory\"} 1"));
}

#[tokio::test]
async fn test_agent_serves_metrics_over_http() {
    let mut rm = Server::new_async().await;
    let mut spark = Server::new_async().await;

    let _apps = mock_apps(
        &mut rm,
        json!({"apps": {"app": [app_json("application_1_0001", "served")]}}),
    )
    .await;
    let _executors = mock_executors(
        &mut spark,
        "application_1_0001",
        json!([{"id": "1", "hostPort": "worker-3:4444", "memoryUsed": 0,
                "totalCores": 2, "totalTasks": 5}]),
    )
    .await;

    let cfg = config(&rm.url(), vec![spark.url()]);
    let mut agent = Agent::new(cfg)
        .expect("agent")
        .with_clock(Arc::new(FixedClock::new(NOW_MS)));
    agent.start().await.expect("start");

    let addr = agent.metrics_addr().expect("bound address");
    let publisher = Arc::clone(agent.publisher());
    for _ in 0..100 {
        if publisher.cycles_total.get() >= 1.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let body = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .expect("scrape")
        .text()
        .await
        .expect("body");

    let tasks = lines_for(&body, "spark_executor_tasks_total");
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].contains("host=\"worker-3\""));
    assert!(tasks[0].ends_with(" 5"));
    assert_eq!(lines_for(&body, "spark_application_info").len(), 1);

    let health = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("healthz")
        .text()
        .await
        .expect("body");
    assert_eq!(health, "ok");

    agent.stop().await.expect("stop");
}

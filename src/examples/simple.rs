//! Fill a pool from public lists, score it, then crawl through it.

use proxy_rotor::{
    DistributedMutex, EngineConfig, HttpProber, JobRunner, JobStatus, RotationMiddleware,
    RotationSelector, Scorer, SourceListAcquirer, SqliteKv, SqliteStore,
};
use reqwest_middleware::ClientBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::builder()
        .probe_timeout(Duration::from_secs(5))
        .retry_count(2)
        .build();

    // Every process pointed at this file shares the pool and the job locks.
    let db = Path::new("proxies.db");
    let store = Arc::new(SqliteStore::open(db)?);
    let mutex = DistributedMutex::new(Arc::new(SqliteKv::open(db)?));

    let scorer = Scorer::new(Arc::new(HttpProber::new(&config)), config.scorer_concurrency);
    let acquirer = Arc::new(SourceListAcquirer::new(vec![
        "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt",
    ]));
    let jobs = JobRunner::new(
        store.clone(),
        scorer.clone(),
        acquirer,
        mutex,
        config.acquisition_lock_ttl,
    );

    println!("Acquiring proxies...");
    if let Some(handle) = jobs.submit_acquisition("all")?.handle() {
        wait(&jobs, handle).await;
    } else {
        println!("Another process is already acquiring");
    }

    println!("Scoring proxies...");
    let handle = jobs.submit_scoring()?;
    wait(&jobs, handle).await;

    let selector = Arc::new(RotationSelector::new(store, scorer, &config));
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(RotationMiddleware::new(selector, &config))
        .build();

    println!("Sending request...");
    let response = client.get("http://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    Ok(())
}

async fn wait(jobs: &JobRunner, handle: proxy_rotor::JobHandle) {
    loop {
        match jobs.status(handle) {
            Some(JobStatus::Pending) | Some(JobStatus::Running) => {
                tokio::time::sleep(Duration::from_millis(500)).await
            }
            Some(status) => {
                println!("Job {handle} finished: {status:?}");
                return;
            }
            None => return,
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const MIN: i64 = 60_000;
const HOUR: i64 = 60 * MIN;

async fn connect(host: &str, port: u16, db: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(user)
        .password(std::env::var("RESERVD_PASSWORD").unwrap_or_else(|_| "reservd".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_db() -> String {
    format!("bench_{}", Ulid::new())
}

/// First whole hour at least a day away; every phase books from here on.
fn base_time() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64;
    (now / HOUR + 24) * HOUR
}

fn reserve_sql(resource: &str, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO reservations (resource_id, start, "end", ttl) VALUES ('{resource}', {start}, {end}, 300000)"#)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16, base: i64) {
    let client = connect(host, port, &fresh_db(), "bench").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * 30 * MIN;
        let t = Instant::now();
        client
            .batch_execute(&reserve_sql("room-seq", s, s + 30 * MIN))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Many owners race for the same slots; every slot must have exactly one winner.
async fn phase2_contention(host: &str, port: u16, base: i64) {
    let db = fresh_db();
    let n_tasks = 20;
    let n_slots = 100;

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &format!("owner{task}")).await;
            for slot in 0..n_slots {
                let s = base + (slot as i64) * HOUR;
                match client.batch_execute(&reserve_sql("room-hot", s, s + HOUR)).await {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().is_some_and(|c| c.code() == "23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots;
    let wins = wins.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} owners x {n_slots} slots = {total} attempts in {:.2}s: {wins} won, {} conflicted",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(wins, n_slots, "each slot must be won exactly once");
}

async fn phase3_slots_under_load(host: &str, port: u16, base: i64) {
    let db = fresh_db();

    let setup_client = connect(host, port, &db, "setup").await;
    for i in 0..200 {
        let s = base + (i as i64) * 2 * HOUR;
        setup_client
            .batch_execute(&reserve_sql("room-read", s, s + HOUR))
            .await
            .unwrap();
    }
    drop(setup_client);

    // Writers book a different resource in the same tenant.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &format!("writer{w}")).await;
            let resource = format!("room-write-{w}");
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = base + i * 30 * MIN;
                let _ = client.batch_execute(&reserve_sql(&resource, s, s + 30 * MIN)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    let window_end = base + 400 * HOUR;

    for r in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &format!("reader{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM slots WHERE resource_id = 'room-read' AND start >= {base} AND "end" <= {window_end} AND duration = {HOUR}"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slot enumeration", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, base: i64) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_db(), &format!("storm{c}")).await;
            for i in 0..ops_per_conn {
                let s = base + (i as i64) * HOUR;
                client
                    .batch_execute(&reserve_sql("room-storm", s, s + HOUR))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RESERVD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RESERVD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RESERVD_PORT");

    println!("=== reservd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference
    let base = base_time();

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&host, port, base).await;

    println!("\n[phase 2] contention on shared slots");
    phase2_contention(&host, port, base).await;

    println!("\n[phase 3] slot enumeration under write load");
    phase3_slots_under_load(&host, port, base).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, base).await;

    println!("\n=== benchmark complete ===");
}

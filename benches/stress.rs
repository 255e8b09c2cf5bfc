use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

// 09:00-21:00 with a 12:00-12:30 break, 30-minute slots: 6 morning + 17
// afternoon windows per day.
const SLOTS_PER_DAY: usize = 23;
const CAPACITY: u32 = 10;
const BOOKINGS_PER_DAY: usize = SLOTS_PER_DAY * CAPACITY as usize;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("slotd")
        .password("slotd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn fmt_minutes(m: u16) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Start/end strings for window `k` of the bench schedule.
fn window(k: usize) -> (String, String) {
    let start = if k < 6 {
        540 + 30 * k as u16 // 09:00 morning block
    } else {
        750 + 30 * (k as u16 - 6) // 12:30 afternoon block
    };
    (fmt_minutes(start), fmt_minutes(start + 30))
}

fn date_for(day: usize) -> NaiveDate {
    Utc::now().date_naive() + Days::new(1 + day as u64)
}

async fn create_salon(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let salon_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (salon_id, working_days, start_time, end_time, \
             break_start_time, break_end_time, slot_duration, max_bookings_per_slot) \
             VALUES ('{salon_id}', 'mon,tue,wed,thu,fri,sat,sun', '09:00', '21:00', \
             '12:00', '12:30', 30, {capacity})"
        ))
        .await
        .unwrap();
    salon_id
}

async fn reserve(client: &tokio_postgres::Client, salon_id: Ulid, i: usize) {
    let booking_id = Ulid::new();
    let customer_id = Ulid::new();
    let day = i / BOOKINGS_PER_DAY;
    let k = (i % BOOKINGS_PER_DAY) / CAPACITY as usize;
    let (start, end) = window(k);
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, salon_id, date, start_time, end_time, customer_id) \
             VALUES ('{booking_id}', '{salon_id}', '{}', '{start}', '{end}', '{customer_id}')",
            date_for(day)
        ))
        .await
        .unwrap();
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let salon_id = create_salon(&client, CAPACITY).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        reserve(&client, salon_id, i).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task is its own tenant (unique dbname from connect()).
            let client = connect(&host, port).await;
            let salon_id = create_salon(&client, CAPACITY).await;
            for i in 0..n_per_task {
                reserve(&client, salon_id, i).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Writer tasks: continuously reserve in the background.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let salon_id = create_salon(&client, CAPACITY).await;
            let mut i = 0usize;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                reserve(&client, salon_id, i).await;
                i += 1;
            }
        }));
    }

    // Reader tasks: query availability and measure latency, each against a
    // tenant with non-trivial state.
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let salon_id = create_salon(&client, CAPACITY).await;
            for i in 0..100 {
                reserve(&client, salon_id, i).await;
            }

            let date = date_for(0);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE salon_id = '{salon_id}' AND date = '{date}'"
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

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_contended_slot(host: &str, port: u16) {
    // Every task targets the same slot of the same salon: exactly CAPACITY
    // reservations must land, the rest must be turned away. All tasks share
    // one tenant, so the dbname is pinned instead of coming from connect().
    let dbname = format!("bench_contended_{}", Ulid::new());
    let n_tasks = 50;
    let ok = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let full = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(&dbname)
        .user("slotd")
        .password("slotd");
    let (shared, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let salon_id = create_salon(&shared, CAPACITY).await;

    let (start_win, end_win) = window(0);
    let date = date_for(0);
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let dbname = dbname.clone();
        let (start_win, end_win) = (start_win.clone(), end_win.clone());
        let (ok, full) = (ok.clone(), full.clone());
        handles.push(tokio::spawn(async move {
            let mut config = Config::new();
            config
                .host(&host)
                .port(port)
                .dbname(&dbname)
                .user("slotd")
                .password("slotd");
            let (client, conn) = config.connect(NoTls).await.expect("connect failed");
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let booking_id = Ulid::new();
            let customer_id = Ulid::new();
            let result = client
                .batch_execute(&format!(
                    "INSERT INTO bookings (id, salon_id, date, start_time, end_time, customer_id) \
                     VALUES ('{booking_id}', '{salon_id}', '{date}', '{start_win}', '{end_win}', '{customer_id}')"
                ))
                .await;
            match result {
                Ok(_) => ok.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                Err(_) => full.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            };
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let landed = ok.load(std::sync::atomic::Ordering::Relaxed);
    let rejected = full.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_tasks} connections racing one slot (capacity {CAPACITY}): \
         {landed} landed, {rejected} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(landed, CAPACITY as usize, "slot oversold or undersold");
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTD_PORT");

    println!("=== slotd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent reserve throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] contended slot storm");
    phase4_contended_slot(&host, port).await;

    println!("\n=== benchmark complete ===");
}

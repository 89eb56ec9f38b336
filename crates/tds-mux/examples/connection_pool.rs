//! Pipelined and multiplexed commands through the pool.
//!
//! # Running
//!
//! ```bash
//! export TDS_HOST=localhost
//! export TDS_USER=sa
//! export TDS_PASSWORD=YourStrong@Passw0rd
//!
//! cargo run --example connection_pool
//! ```
//!
//! The server must accept unencrypted connections.

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use tds_mux::{
    Command, FlushMode, Pool, PoolConfig, PoolStatus, SessionConfig, TcpConnector,
};
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let host = std::env::var("TDS_HOST").unwrap_or_else(|_| "localhost".into());
    let user = std::env::var("TDS_USER").unwrap_or_else(|_| "sa".into());
    let password = std::env::var("TDS_PASSWORD").unwrap_or_else(|_| "Password123!".into());

    let session_config = SessionConfig::new()
        .host(host)
        .credentials(user, password)
        .database("master")
        .pipeline_depth(8);
    let pool_config = PoolConfig::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10));

    let pool = Pool::new(pool_config, session_config, TcpConnector)?;

    // 1. two deferred writes share one flush
    println!("1. Pipelined batch on one connection:");
    {
        let slot = pool.get_slot(false, Duration::from_secs(10)).await?;
        let first = slot
            .write(&Command::new("SELECT @@VERSION"), FlushMode::Deferred)
            .await?;
        let slot = pool.get_slot(false, Duration::from_secs(10)).await?;
        let second = slot
            .write(&Command::new("SELECT DB_NAME()"), FlushMode::Deferred)
            .await?;
        println!("  flushed before first read: {}", second.is_flushed());

        let mut rows = first.read().await?;
        while rows.next_row()? {
            let version = rows.get_string(0)?;
            println!("  server: {}...", &version[..50.min(version.len())]);
        }
        rows.finish()?;

        let mut rows = second.read().await?;
        if rows.next_row()? {
            println!("  database: {}", rows.get_string(0)?);
        }
        rows.finish()?;
    }
    print_status(&pool.status());

    // 2. many tasks sharing the pool
    println!("\n2. Multiplexed usage (32 parallel commands):");
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..32 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let command = Command::new(format!("SELECT {i}"));
            let mut rows = pool.write_multiplexing_command(&command).await?.read().await?;
            let mut value = None;
            while rows.next_row()? {
                value = Some(rows.get_i32(0)?);
            }
            rows.finish()?;
            Ok::<_, tds_mux::Error>(value)
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if let Ok(Ok(Some(_))) = handle.await {
            completed += 1;
        }
    }
    println!("  completed {completed} commands in {:?}", start.elapsed());
    print_status(&pool.status());

    // 3. a timed-out command is abandoned and drained
    println!("\n3. Command timeout:");
    let slow = pool
        .write_multiplexing_command(
            &Command::new("WAITFOR DELAY '00:00:02'; SELECT 1")
                .with_timeout(Duration::from_millis(200)),
        )
        .await?;
    match slow.read().await {
        Err(err) if err.is_timeout() => println!("  timed out as expected: {err}"),
        other => println!("  unexpected outcome: {:?}", other.map(|_| ())),
    }

    println!("\n4. Shutdown:");
    pool.close().await;
    print_status(&pool.status());

    Ok(())
}

fn print_status(status: &PoolStatus) {
    println!(
        "  sessions {}/{} (opening {}), active slots {}, pending reads {}",
        status.sessions, status.max, status.opening, status.active_slots, status.pending_reads
    );
    println!(
        "  buffers: rented {}, returned {}, allocated {}, free {}",
        status.buffers.rented, status.buffers.returned, status.buffers.allocated, status.buffers.free
    );
}

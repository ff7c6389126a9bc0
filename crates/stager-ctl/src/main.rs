//! stager-ctl — command-line interface for the staging daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_PORT: u16 = 9201;

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    transport:       String,
    uptime_secs:     u64,
    nodes:           usize,
    queued_tasks:    usize,
    requests_total:  usize,
    requests_active: usize,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id:    u64,
    tasks: usize,
}

#[derive(Deserialize)]
struct RequestsResponse {
    requests: Vec<RequestStatus>,
}

#[derive(Deserialize)]
struct RequestStatus {
    id:              u64,
    state:           String,
    degraded:        bool,
    progress_pct:    f32,
    bw_mbps:         f32,
    tasks_total:     usize,
    tasks_completed: usize,
    errors:          Vec<TaskError>,
}

#[derive(Deserialize)]
struct TaskError {
    task_index: u32,
    kind:       String,
    message:    String,
}

#[derive(Deserialize)]
struct CancelResponse {
    id:      u64,
    outcome: String,
}

#[derive(Deserialize)]
struct ShapingResponse {
    id:            u64,
    bytes_per_sec: u64,
}

#[derive(Deserialize)]
struct NodesResponse {
    nodes:        Vec<NodeInfo>,
    queued_tasks: usize,
}

#[derive(Deserialize)]
struct NodeInfo {
    node:    String,
    workers: u32,
}

#[derive(Deserialize)]
struct NodesChangeResponse {
    changed: usize,
}

#[derive(Deserialize)]
struct PingResponse {
    ok:      bool,
    version: String,
}

// ── HTTP helpers ──────────────────────────────────────────────────────────────

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to stagerd at {} — is it running?", url))?;
    if !resp.status().is_success() {
        anyhow::bail!("{}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    resp.json::<T>().await.context("failed to parse response")
}

async fn post_json<T: for<'de> Deserialize<'de>>(
    url: &str,
    body: Option<serde_json::Value>,
) -> Result<T> {
    let client = reqwest::Client::new();
    let req = match body {
        Some(b) => client.post(url).json(&b),
        None => client.post(url),
    };
    let resp = req
        .send()
        .await
        .with_context(|| format!("failed to connect to stagerd at {} — is it running?", url))?;
    if !resp.status().is_success() {
        anyhow::bail!("{}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    resp.json::<T>().await.context("failed to parse response")
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Stager Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Transport        : {}", resp.transport);
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Nodes            : {}", resp.nodes);
    println!("  Queued tasks     : {}", resp.queued_tasks);
    println!("  Requests (total) : {}", resp.requests_total);
    println!("  Requests (active): {}", resp.requests_active);

    Ok(())
}

struct CopyOpts {
    mode:     &'static str,
    policy:   &'static str,
    priority: &'static str,
    wait:     bool,
}

async fn cmd_copy(port: u16, sources: &[&str], targets: &[&str], opts: CopyOpts) -> Result<()> {
    let body = json!({
        "sources": sources.iter().map(|p| json!({ "path": p })).collect::<Vec<_>>(),
        "targets": targets.iter().map(|p| json!({ "path": p })).collect::<Vec<_>>(),
        "mode": opts.mode,
        "policy": opts.policy,
        "priority": opts.priority,
    });
    let resp: SubmitResponse = post_json(&format!("{}/submit", base_url(port)), Some(body)).await?;
    println!("Request {} admitted ({} tasks).", resp.id, resp.tasks);

    if opts.wait {
        cmd_wait(port, resp.id).await?;
    }
    Ok(())
}

fn print_request(r: &RequestStatus) {
    let flag = if r.degraded { " (degraded)" } else { "" };
    println!("  ┌─ request {}", r.id);
    println!("  │  state    : {}{}", r.state, flag);
    println!("  │  progress : {:.1}%", r.progress_pct);
    println!("  │  tasks    : {}/{}", r.tasks_completed, r.tasks_total);
    println!("  └─ bandwidth: {:.1} MB/s", r.bw_mbps);
    for e in &r.errors {
        println!("     task {}: [{}] {}", e.task_index, e.kind, e.message);
    }
}

async fn cmd_request(port: u16, id: u64) -> Result<()> {
    let resp: RequestStatus = get_json(&format!("{}/requests/{}", base_url(port), id)).await?;
    print_request(&resp);
    Ok(())
}

async fn cmd_requests(port: u16) -> Result<()> {
    let resp: RequestsResponse = get_json(&format!("{}/requests", base_url(port))).await?;
    if resp.requests.is_empty() {
        println!("No staging requests.");
        return Ok(());
    }
    println!("═══════════════════════════════════════");
    println!("  Staging Requests ({})", resp.requests.len());
    println!("═══════════════════════════════════════");
    for r in &resp.requests {
        print_request(r);
    }
    Ok(())
}

async fn cmd_wait(port: u16, id: u64) -> Result<()> {
    let url = format!("{}/requests/{}", base_url(port), id);
    loop {
        let resp: RequestStatus = get_json(&url).await?;
        match resp.state.as_str() {
            "completed" | "failed" | "cancelled" => {
                print_request(&resp);
                if resp.state != "completed" {
                    std::process::exit(1);
                }
                return Ok(());
            }
            _ => {
                println!(
                    "request {}: {} {:.1}% ({:.1} MB/s)",
                    id, resp.state, resp.progress_pct, resp.bw_mbps
                );
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
    }
}

async fn cmd_cancel(port: u16, id: u64) -> Result<()> {
    let resp: CancelResponse =
        post_json(&format!("{}/requests/{}/cancel", base_url(port), id), None).await?;
    println!("Request {}: {}.", resp.id, resp.outcome);
    Ok(())
}

async fn cmd_shaping(port: u16, id: u64, bytes_per_sec: u64) -> Result<()> {
    let resp: ShapingResponse = post_json(
        &format!("{}/requests/{}/shaping", base_url(port), id),
        Some(json!({ "bytes_per_sec": bytes_per_sec })),
    )
    .await?;
    if resp.bytes_per_sec == 0 {
        println!("Request {}: bandwidth limit removed.", resp.id);
    } else {
        println!("Request {}: limited to {} B/s.", resp.id, resp.bytes_per_sec);
    }
    Ok(())
}

async fn cmd_nodes(port: u16) -> Result<()> {
    let resp: NodesResponse = get_json(&format!("{}/nodes", base_url(port))).await?;
    println!("═══════════════════════════════════════");
    println!("  Worker Nodes ({})", resp.nodes.len());
    println!("═══════════════════════════════════════");
    for n in &resp.nodes {
        println!("  {} : {} workers", n.node, n.workers);
    }
    println!("  Queued tasks: {}", resp.queued_tasks);
    Ok(())
}

async fn cmd_nodes_change(port: u16, action: &str, nodes: &[&str]) -> Result<()> {
    let resp: NodesChangeResponse = post_json(
        &format!("{}/nodes/{}", base_url(port), action),
        Some(json!({ "nodes": nodes })),
    )
    .await?;
    println!("{} node(s) {}ed.", resp.changed, action.trim_end_matches('e'));
    Ok(())
}

async fn cmd_ping(port: u16) -> Result<()> {
    let resp: PingResponse = get_json(&format!("{}/ping", base_url(port))).await?;
    if resp.ok {
        println!("stagerd {} is up.", resp.version);
    }
    Ok(())
}

async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }
    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port)), None).await?;
    println!("{}", resp.message);
    Ok(())
}

fn print_usage() {
    println!("Usage: stager-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  copy <src>... : <dst>...  Stage datasets (source list, colon, target list)");
    println!("      [--move] [--best-effort] [--high] [--wait]");
    println!("  status                    Show daemon status");
    println!("  requests                  List staging requests");
    println!("  request <id>              Show one request");
    println!("  wait <id>                 Block until a request finishes");
    println!("  cancel <id>               Cancel a request");
    println!("  shaping <id> <B/s>        Set per-request bandwidth limit (0 removes)");
    println!("  nodes                     List worker nodes");
    println!("  nodes add <node>...       Add node contexts");
    println!("  nodes remove <node>...    Revoke node contexts");
    println!("  ping                      Check daemon liveness");
    println!("  shutdown                  Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port and copy flags up front
    let mut port = DEFAULT_PORT;
    let mut opts = CopyOpts {
        mode:     "copy",
        policy:   "abort_on_first_failure",
        priority: "normal",
        wait:     false,
    };
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--move" => opts.mode = "move",
            "--best-effort" => opts.policy = "best_effort",
            "--high" => opts.priority = "high",
            "--wait" => opts.wait = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd_status(port).await,
        ["copy", rest @ ..] => {
            let split = rest
                .iter()
                .position(|a| *a == ":")
                .context("copy needs a colon between sources and targets")?;
            let (sources, targets) = (&rest[..split], &rest[split + 1..]);
            if sources.is_empty() || sources.len() != targets.len() {
                anyhow::bail!(
                    "copy needs equally many sources and targets, got {} and {}",
                    sources.len(),
                    targets.len()
                );
            }
            cmd_copy(port, sources, targets, opts).await
        }
        ["requests"] => cmd_requests(port).await,
        ["request", id] => cmd_request(port, id.parse().context("request id must be a number")?).await,
        ["wait", id] => cmd_wait(port, id.parse().context("request id must be a number")?).await,
        ["cancel", id] => cmd_cancel(port, id.parse().context("request id must be a number")?).await,
        ["shaping", id, rate] => {
            cmd_shaping(
                port,
                id.parse().context("request id must be a number")?,
                rate.parse().context("rate must be a number of bytes/sec")?,
            )
            .await
        }
        ["nodes"] => cmd_nodes(port).await,
        ["nodes", "add", nodes @ ..] if !nodes.is_empty() => {
            cmd_nodes_change(port, "add", nodes).await
        }
        ["nodes", "remove", nodes @ ..] if !nodes.is_empty() => {
            cmd_nodes_change(port, "remove", nodes).await
        }
        ["ping"] => cmd_ping(port).await,
        ["shutdown"] => cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

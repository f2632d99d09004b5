use clap::{Parser, Subcommand};

use estimatedw::{EstimateDW, Period, QuoteQuery, QuoteStatus};

#[derive(Parser)]
#[command(name = "estimatedw", about = "Renovation estimate statistics engine")]
struct Cli {
    /// Database path (default: ~/.estimatedw/estimatedw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the dashboard snapshots now
    Refresh {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the work-type and region rollups for one period
    RefreshTrends {
        /// Period: 2025, 2025-Q1, 2025-03, 2025-W05
        #[arg(long)]
        period: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show global KPIs from the last refresh
    Kpis {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show client segmentation from the last refresh
    Segments {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the most used work categories from the last refresh
    TopCategories {
        /// Maximum rows (default: top_categories_limit)
        #[arg(long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show trend rollups for a period
    Trend {
        #[command(subcommand)]
        target: TrendTarget,
    },
    /// Show a client's derived metrics
    Client {
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List quotes with filters
    Quotes {
        /// Filter by client id
        #[arg(long)]
        client: Option<i64>,
        /// Filter by status (PENDING, ACCEPTED, ...)
        #[arg(long)]
        status: Option<String>,
        /// Quote date on or after (YYYY-MM-DD)
        #[arg(long)]
        after: Option<String>,
        /// Quote date on or before (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,
        /// Filter by département code (75, 2A, 974, UNKNOWN)
        #[arg(long)]
        region: Option<String>,
        /// Only quotes flagged as thermal leaks
        #[arg(long)]
        thermal_leak: bool,
        /// Include soft-deleted quotes
        #[arg(long)]
        include_deleted: bool,
        /// Sort by: date, number, total, status
        #[arg(long, default_value = "date")]
        order_by: String,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Maximum results
        #[arg(long, default_value = "100")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Output as CSV
        #[arg(long)]
        csv: bool,
        /// Count only (no output rows)
        #[arg(long)]
        count: bool,
    },
    /// Import clients, quotes and their details from a JSON batch file
    Import {
        file: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Refresh periodically until interrupted
    Watch,
    /// Show store counts and the refresh watermark
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TrendTarget {
    /// Per-category rollups
    WorkType {
        /// Period: 2025, 2025-Q1, 2025-03, 2025-W05
        #[arg(long)]
        period: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Per-département rollups
    Region {
        /// Period: 2025, 2025-Q1, 2025-03, 2025-W05
        #[arg(long)]
        period: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

fn parse_date(s: &str) -> anyhow::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("invalid date '{s}', expected YYYY-MM-DD"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let dw = EstimateDW::open(cli.db.as_deref().map(std::path::Path::new)).await?;

    match cli.command {
        Commands::Refresh { json } => {
            let report = dw.refresh_all().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Refresh v{} at {}", report.version, report.refreshed_at);
                println!("  Status:     {:?}", report.status);
                println!("  Quotes:     {}", report.total_quotes);
                println!("  Segments:   {}", report.segments);
                println!("  Categories: {}", report.categories);
                println!("  Duration:   {} ms", report.duration_ms);
            }
        }
        Commands::RefreshTrends { period, json } => {
            let p = Period::parse(&period)?;
            let report = dw.refresh_trends(p).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Trends {} at {}", report.period, report.updated_at);
                println!("  Work types: {}", report.work_type_rows);
                println!("  Regions:    {}", report.region_rows);
                println!("  Duration:   {} ms", report.duration_ms);
            }
        }
        Commands::Kpis { json } => {
            let snap = dw.get_global_kpis().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                let k = &snap.data;
                println!("Global KPIs (v{}, as of {})", snap.version, snap.as_of);
                println!("  Quotes:        {}", k.total_quotes);
                println!("  Total HT:      {:.2}", k.total_ht);
                println!("  Total TTC:     {:.2}", k.total_ttc);
                println!("  Clients:       {}", k.distinct_clients);
                println!(
                    "  Thermal leaks: {} ({:.1}%)",
                    k.thermal_leak_count, k.thermal_leak_pct
                );
            }
        }
        Commands::Segments { json } => {
            let snap = dw.get_client_segments().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else if snap.data.is_empty() {
                println!("No active clients.");
            } else {
                println!("Client segments (v{}, as of {})", snap.version, snap.as_of);
                for s in &snap.data {
                    println!(
                        "  {:<18} {:>5} ({:>5.1}%)  {:>12.2} HT",
                        s.client_type.as_str(),
                        s.client_count,
                        s.client_pct,
                        s.revenue_ht
                    );
                }
            }
        }
        Commands::TopCategories { limit, json } => {
            let snap = dw.get_top_work_categories(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else if snap.data.is_empty() {
                println!("No line items.");
            } else {
                println!("Top work categories (v{}, as of {})", snap.version, snap.as_of);
                for c in &snap.data {
                    println!(
                        "  {:>3}. {:<24} {:>5} lines  avg {:>10.2}  total {:>12.2}  ({:.1}%)",
                        c.rank, c.category, c.line_count, c.avg_line_value, c.total_ht, c.share_pct
                    );
                }
            }
        }
        Commands::Trend { target } => {
            handle_trend(&dw, target).await?;
        }
        Commands::Client { id, json } => {
            let report = dw.get_client_metrics(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let m = &report.metrics;
                println!("Client: {} ({})", report.client_name, report.client_id);
                println!("  Type:       {}", report.client_type);
                println!("  Quotes:     {}", m.quote_count);
                println!("  Revenue HT: {:.2}", m.revenue_ht);
                println!("  Revenue TTC: {:.2}", m.revenue_ttc);
                println!("  Conversion: {:.2}%", m.conversion_rate);
                println!("  Updated:    {}", report.updated_at);
            }
        }
        Commands::Quotes {
            client,
            status,
            after,
            before,
            region,
            thermal_leak,
            include_deleted,
            order_by,
            desc,
            limit,
            json,
            csv,
            count,
        } => {
            let mut builder = QuoteQuery::new().limit(limit).order_by(&order_by);
            if desc {
                builder = builder.descending();
            }
            if let Some(id) = client {
                builder = builder.client(id);
            }
            if let Some(s) = status {
                builder = builder.status(QuoteStatus::parse(&s)?);
            }
            if let Some(d) = after {
                builder = builder.date_after(parse_date(&d)?);
            }
            if let Some(d) = before {
                builder = builder.date_before(parse_date(&d)?);
            }
            if let Some(r) = region {
                builder = builder.region(&r);
            }
            if thermal_leak {
                builder = builder.thermal_leak(true);
            }
            if include_deleted {
                builder = builder.include_deleted();
            }
            handle_quotes(&dw, builder, json, csv, count).await?;
        }
        Commands::Import { file, json } => {
            let batch = estimatedw::ImportBatch::from_file(&file)?;
            let report = dw.import_batch(batch).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Import: {file}");
                println!(
                    "  Clients:    {} new, {} updated",
                    report.clients_inserted, report.clients_updated
                );
                println!(
                    "  Quotes:     {} new, {} skipped, {} without client",
                    report.quotes_inserted, report.quotes_skipped, report.quotes_unassigned
                );
                println!("  Work areas: {}", report.work_areas_inserted);
                println!("  Lines:      {}", report.line_items_inserted);
                println!("  Payments:   {}", report.payments_inserted);
                if report.children_skipped > 0 {
                    println!("  Skipped:    {} details", report.children_skipped);
                }
            }
        }
        Commands::Watch => {
            let scheduler = dw.spawn_scheduler().await?;
            eprintln!("Refreshing in the background; press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            eprintln!("Stopping...");
            scheduler.shutdown().await;
        }
        Commands::Status { json } => {
            let status = dw.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let c = &status.counts;
                println!("Store:");
                println!("  Clients:    {} ({} deleted)", c.clients, c.deleted_clients);
                println!("  Quotes:     {} ({} deleted)", c.quotes, c.deleted_quotes);
                if c.unassigned_quotes > 0 {
                    println!("  Unassigned: {} (in KPIs, in no segment)", c.unassigned_quotes);
                }
                println!("  Line items: {}", c.line_items);
                println!("  Payments:   {}", c.payments);
                match &status.watermark {
                    Some(w) => println!(
                        "Last refresh: v{} at {} ({} ms)",
                        w.version, w.refreshed_at, w.duration_ms
                    ),
                    None => println!("Last refresh: never"),
                }
                match (&status.lease, status.refresh_running) {
                    (Some(l), true) => println!(
                        "A refresh is running (lease {} until {}).",
                        l.holder, l.expires_at
                    ),
                    (Some(l), false) => println!(
                        "Stale refresh lease from {} (expired {}); the next refresh takes it over.",
                        l.holder, l.expires_at
                    ),
                    (None, true) => println!("A refresh is running."),
                    (None, false) => {}
                }
            }
        }
        Commands::Config { action } => {
            handle_config(&dw, action).await?;
        }
    }

    Ok(())
}

async fn handle_trend(dw: &EstimateDW, target: TrendTarget) -> anyhow::Result<()> {
    match target {
        TrendTarget::WorkType { period, json } => {
            let p = Period::parse(&period)?;
            let rows = dw.get_work_type_trend(p.period_type(), p.period_date()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No rollups for {p}. Run 'estimatedw refresh-trends --period {p}'.");
            } else {
                println!("Work types: {p}");
                for r in &rows {
                    println!(
                        "  {:<24} {:>4} quotes {:>5} lines  {:>12.2} HT  {:>+7.1}% {:?}",
                        r.category, r.quote_count, r.line_count, r.total_ht, r.evolution_pct, r.trend
                    );
                }
            }
        }
        TrendTarget::Region { period, json } => {
            let p = Period::parse(&period)?;
            let rows = dw.get_region_trend(p.period_type(), p.period_date()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No rollups for {p}. Run 'estimatedw refresh-trends --period {p}'.");
            } else {
                println!("Regions: {p}");
                for r in &rows {
                    println!(
                        "  {:<8} {:>4} quotes {:>4} accepted ({:>6.2}%)  {:>12.2} HT  {:>+7.1}% {:?}",
                        r.region,
                        r.quote_count,
                        r.accepted_count,
                        r.conversion_rate,
                        r.total_ht,
                        r.evolution_pct,
                        r.trend
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_quotes(
    dw: &EstimateDW,
    builder: QuoteQuery,
    json: bool,
    csv: bool,
    count: bool,
) -> anyhow::Result<()> {
    let db = dw.db();
    if count {
        let n = builder.count(db).await?;
        println!("{n}");
    } else if json {
        let output = builder.to_json(db).await?;
        println!("{output}");
    } else if csv {
        let output = builder.to_csv(db).await?;
        print!("{output}");
    } else {
        let rows = builder.quotes(db).await?;
        if rows.is_empty() {
            println!("No quotes found.");
        } else {
            for row in &rows {
                let client = row.client_name.as_deref().unwrap_or("no client");
                let deleted = if row.deleted { " (deleted)" } else { "" };
                println!(
                    "[{}] {} {} - {client} | {} | {:.2} HT{deleted}",
                    row.status, row.number, row.quote_date, row.region, row.total_ht
                );
            }
            println!("\n{} quotes", rows.len());
        }
    }
    Ok(())
}

async fn handle_config(dw: &EstimateDW, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match dw.config_get(&key).await? {
            Some(value) => println!("{value}"),
            None => {
                let default = estimatedw::config::KNOWN_KEYS
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| *v);
                match default {
                    Some(v) => println!("{v} (default)"),
                    None => println!("(not set)"),
                }
            }
        },
        ConfigAction::Set { key, value } => {
            dw.config_set(&key, &value).await?;
            println!("Set {key} = {value}");
        }
        ConfigAction::List => {
            let entries = dw.config_list().await?;
            for (key, default) in estimatedw::config::KNOWN_KEYS {
                if !entries.iter().any(|(k, _)| k == key) {
                    println!("{key} = {default} (default)");
                }
            }
            for (key, value) in &entries {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, Write};
use tokio_postgres::{Client, NoTls};

#[derive(Parser, Debug)]
#[command(
    name = "bvrag-index-setup",
    about = "Ensure the weighted search vector, GIN index and serving-time tables exist"
)]
struct SetupCli {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Full-text language passed to to_tsvector
    #[arg(long, env = "BVRAG_FTS_LANGUAGE", default_value = "english")]
    language: String,

    /// Analyze the touched tables after ensuring indexes
    #[arg(long, default_value_t = true)]
    analyze: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SetupCli::parse();
    let language = cli.language.trim();
    anyhow::ensure!(!language.is_empty(), "language must not be empty");

    let (client, connection) = tokio_postgres::connect(&cli.database_url, NoTls)
        .await
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {err}");
        }
    });
    let mut client = client;

    let total_steps = 4 + usize::from(cli.analyze);
    let mut completed = 0usize;

    render_progress(completed, total_steps, "ensuring weighted search_vector column");
    ensure_search_vector(&mut client, language).await?;
    completed += 1;
    render_progress(completed, total_steps, "creating GIN index");
    ensure_search_index(&mut client).await?;
    completed += 1;
    render_progress(completed, total_steps, "ensuring chunk_utilities table");
    ensure_utility_table(&mut client).await?;
    completed += 1;
    render_progress(completed, total_steps, "ensuring session tables");
    ensure_session_tables(&mut client).await?;
    completed += 1;
    if cli.analyze {
        render_progress(completed, total_steps, "running ANALYZE");
        analyze_tables(&mut client).await?;
        completed += 1;
    }
    render_progress(completed, total_steps, "complete");
    if total_steps > 0 {
        println!();
    }
    println!("Ensured search_vector, chunk_utilities, sessions and user_profiles exist.");
    Ok(())
}

/// Title and regulation identifier carry the highest rank weight, breadcrumb
/// a medium one and the body the lowest, matching the lexical ranking
/// contract.
async fn ensure_search_vector(client: &mut Client, language: &str) -> Result<()> {
    let literal = escape_literal(language);
    let alter = format!(
        "ALTER TABLE regulations ADD COLUMN IF NOT EXISTS search_vector TSVECTOR \
         GENERATED ALWAYS AS ( \
            setweight(to_tsvector('{literal}', coalesce(title, '')), 'A') || \
            setweight(to_tsvector('{literal}', coalesce(regulation, '')), 'A') || \
            setweight(to_tsvector('{literal}', coalesce(breadcrumb, '')), 'B') || \
            setweight(to_tsvector('{literal}', coalesce(body_text, '')), 'D') \
         ) STORED"
    );
    client
        .execute(&alter, &[])
        .await
        .context("failed to ensure search_vector column")?;
    Ok(())
}

async fn ensure_search_index(client: &mut Client) -> Result<()> {
    client
        .execute(
            "CREATE INDEX IF NOT EXISTS regulations_search_vector_gin \
             ON regulations USING GIN (search_vector)",
            &[],
        )
        .await
        .context("failed to ensure search_vector GIN index")?;
    Ok(())
}

async fn ensure_utility_table(client: &mut Client) -> Result<()> {
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS chunk_utilities ( \
                chunk_id TEXT NOT NULL, \
                query_category TEXT NOT NULL, \
                utility_score DOUBLE PRECISION NOT NULL DEFAULT 0.5, \
                use_count BIGINT NOT NULL DEFAULT 0, \
                success_count BIGINT NOT NULL DEFAULT 0, \
                last_used TIMESTAMPTZ, \
                PRIMARY KEY (chunk_id, query_category) \
            )",
            &[],
        )
        .await
        .context("failed to ensure chunk_utilities table")?;
    Ok(())
}

async fn ensure_session_tables(client: &mut Client) -> Result<()> {
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS sessions ( \
                session_id TEXT PRIMARY KEY, \
                data JSONB NOT NULL, \
                expires_at TIMESTAMPTZ NOT NULL \
            )",
            &[],
        )
        .await
        .context("failed to ensure sessions table")?;
    client
        .execute(
            "CREATE INDEX IF NOT EXISTS sessions_expires_at_idx ON sessions (expires_at)",
            &[],
        )
        .await
        .context("failed to ensure sessions expiry index")?;
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS user_profiles ( \
                user_id TEXT PRIMARY KEY, \
                data JSONB NOT NULL \
            )",
            &[],
        )
        .await
        .context("failed to ensure user_profiles table")?;
    Ok(())
}

async fn analyze_tables(client: &mut Client) -> Result<()> {
    for table in ["regulations", "chunks", "chunk_utilities"] {
        let sql = format!("ANALYZE {table}");
        client
            .execute(&sql, &[])
            .await
            .with_context(|| format!("failed to analyze {table}"))?;
    }
    Ok(())
}

fn escape_literal(input: &str) -> String {
    input.replace('\'', "''")
}

fn render_progress(done: usize, total: usize, label: &str) {
    if total == 0 {
        return;
    }
    let pct = (done as f64 / total as f64) * 100.0;
    print!("\r[{}/{}] {:.1}% {}", done, total, pct, label);
    let _ = io::stdout().flush();
}

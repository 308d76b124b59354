//! Probe: Portals actions feed
//!
//! Fetches pages of purchase actions with a captured token and documents:
//! - Response status and latency per page
//! - Sale identifiers and ordering (newest first?)
//! - Overlap between consecutive pages
//! - The channel message each sale would produce

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

use portals_sale_monitor::PORTALS_API_URL;
use portals_sale_monitor::api::{FeedClient, SaleFeed};
use portals_sale_monitor::credential::{Credential, normalize_token};
use portals_sale_monitor::notifier::render_message;
use portals_sale_monitor::types::Cursor;

#[derive(Parser)]
#[command(name = "probe-feed", about = "Fetch Portals sale pages and print what would be posted")]
struct Args {
    /// Authorization token (falls back to PORTALS_TOKEN, then a prompt)
    #[arg(long)]
    token: Option<String>,

    /// Feed endpoint
    #[arg(long, default_value = PORTALS_API_URL)]
    api_url: String,

    #[arg(long, default_value_t = 20)]
    page_size: u32,

    /// Number of pages to walk
    #[arg(long, default_value_t = 2)]
    pages: u32,

    /// Print rendered messages
    #[arg(long)]
    render: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let raw = match args.token.clone().or_else(|| std::env::var("PORTALS_TOKEN").ok()) {
        Some(token) => token,
        None => rpassword::prompt_password("Portals token (input hidden): ")?,
    };
    let token = normalize_token(&raw).ok_or_else(|| anyhow::anyhow!("empty token"))?;
    let credential = Credential::new(token, Utc::now());

    let client = FeedClient::new(&args.api_url, args.page_size, Duration::from_secs(15))?;

    println!("=== Probe: Portals actions feed ===");
    println!("Endpoint: {}", args.api_url);
    println!("Credential: {}", credential.fingerprint());
    println!();

    let mut cursor = Cursor::start();
    let mut seen: HashSet<String> = HashSet::new();
    for page_no in 1..=args.pages {
        println!("--- Page {page_no} (offset {}) ---", cursor.offset());
        let start = Instant::now();
        let page = match client.fetch_page(cursor, &credential).await {
            Ok(page) => page,
            Err(e) => {
                println!("Fetch failed after {:?}: {e}", start.elapsed());
                break;
            }
        };
        println!("Latency: {:?}", start.elapsed());
        println!("Entries: {} ({} purchases)", page.entries, page.sales.len());
        println!("Has more: {}", page.has_more);

        let mut overlap = 0;
        let mut previous = None;
        let mut ordered = true;
        for sale in &page.sales {
            if !seen.insert(sale.id.clone()) {
                overlap += 1;
            }
            if previous.is_some_and(|p| p < sale.sold_at) {
                ordered = false;
            }
            previous = Some(sale.sold_at);
            println!(
                "  {} | {} #{} | {} TON | {}",
                sale.sold_at.format("%Y-%m-%d %H:%M:%S"),
                sale.gift_name,
                sale.gift_number,
                sale.sale_price.normalize(),
                sale.id
            );
        }
        println!("Newest first: {ordered}");
        println!("Already seen on earlier pages: {overlap}");

        if args.render {
            for sale in &page.sales {
                println!();
                println!("{}", render_message(sale));
            }
        }
        println!();

        if !page.has_more {
            break;
        }
        cursor = page.next;
    }

    println!("=== Done: {} distinct sales ===", seen.len());
    Ok(())
}

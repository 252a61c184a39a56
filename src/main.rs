mod cli;

use std::time::Duration;

use clap::Parser;

use proxyhive::broker::{Broker, FindOptions, GrabOptions, ServeOptions};
use proxyhive::proxy::{Anonymity, Proto, Proxy};
use proxyhive::resolver::Resolver;
use proxyhive::utils::logger::setup_logger;
use proxyhive::utils::serializer::ProxyData;

use crate::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logger(cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut broker = Broker::new(Resolver::new());
    broker.timeout = Duration::from_secs(cli.timeout);
    broker.max_conn = cli.max_conn;
    broker.max_tries = cli.max_tries;

    match cli.command {
        Command::Find {
            types,
            limit,
            countries,
            levels,
            post,
            strict,
            verify_ssl,
            json,
        } => {
            let opts = FindOptions {
                types: parse_types(&types)?,
                limit,
                countries,
                levels: parse_levels(&levels)?,
                post,
                strict,
                verify_ssl,
            };
            let mut rx = broker.find(opts).await?;
            let mut found = 0usize;
            while let Some(proxy) = rx.recv().await {
                print_proxy(&proxy, json)?;
                found += 1;
                if limit > 0 && found >= limit {
                    break;
                }
            }
            log::info!("{} working proxies found", found);
            broker.stop();
        }

        Command::Grab {
            limit,
            countries,
            json,
        } => {
            let opts = GrabOptions {
                types: vec![],
                limit,
                countries,
            };
            let mut rx = broker.grab(opts).await;
            let mut grabbed = 0usize;
            while let Some(proxy) = rx.recv().await {
                print_proxy(&proxy, json)?;
                grabbed += 1;
                if limit > 0 && grabbed >= limit {
                    break;
                }
            }
            log::info!("{} proxies grabbed", grabbed);
            broker.stop();
        }

        Command::Serve {
            host,
            port,
            types,
            min_queue,
            countries,
            levels,
        } => {
            let opts = ServeOptions {
                host,
                port,
                min_queue,
                find: FindOptions {
                    types: parse_types(&types)?,
                    countries,
                    levels: parse_levels(&levels)?,
                    ..FindOptions::default()
                },
            };
            let addr = broker.serve(opts).await?;
            log::info!("rotating proxy listening on http://{}", addr);

            tokio::signal::ctrl_c().await?;
            broker.stop();
        }
    }

    Ok(())
}

fn print_proxy(proxy: &Proxy, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&ProxyData::from(proxy))?);
    } else {
        println!("{}", proxy);
    }
    Ok(())
}

fn parse_types(raw: &[String]) -> anyhow::Result<Vec<Proto>> {
    if raw.is_empty() {
        return Ok(vec![Proto::Http, Proto::Https]);
    }
    raw.iter().map(|t| Ok(t.parse::<Proto>()?)).collect()
}

fn parse_levels(raw: &[String]) -> anyhow::Result<Vec<Anonymity>> {
    raw.iter().map(|l| Ok(l.parse::<Anonymity>()?)).collect()
}

use crate::table::{Column, Table};
use anyhow::Result;
use haproxy_canary_controller::render::Model;
use serde::Serialize;

/// One server of one frontend as the proxy would see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    frontend: String,
    bind_port: u16,
    server: String,
    version: String,
    address: String,
    weight: u32,
}

pub fn status(model: &Model) -> Vec<ServerStatus> {
    model
        .frontends
        .iter()
        .flat_map(|fe| {
            fe.servers.iter().map(move |server| ServerStatus {
                frontend: fe.name.clone(),
                bind_port: fe.bind_port,
                server: server.name.clone(),
                version: server.version.clone(),
                address: format!("{}:{}", server.host, server.port),
                weight: model
                    .weights
                    .get(&server.name)
                    .copied()
                    .unwrap_or(server.weight),
            })
        })
        .collect()
}

pub fn print_status(results: &[ServerStatus]) {
    print!("{}", table(results));
}

fn table(results: &[ServerStatus]) -> Table<'_, ServerStatus> {
    Table {
        cols: vec![
            Column::new("FRONTEND", |s: &ServerStatus| s.frontend.clone()),
            Column::new("BIND", |s: &ServerStatus| s.bind_port.to_string()),
            Column::new("SERVER", |s: &ServerStatus| s.server.clone()),
            Column::new("VERSION", |s: &ServerStatus| s.version.clone()),
            Column::new("ADDRESS", |s: &ServerStatus| s.address.clone()),
            Column::new("WEIGHT", |s: &ServerStatus| s.weight.to_string()),
        ],
        rows: results,
    }
}

pub fn json_print_status(results: &[ServerStatus]) -> Result<()> {
    serde_json::to_writer_pretty(std::io::stdout(), results)?;
    println!();
    Ok(())
}

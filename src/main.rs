use anyhow::{anyhow, bail, Context};

const USAGE: &str = "usage: charnoks-pos [run | status | configure <json> | factory-reset]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => charnoks_pos_lib::run(),
        Some("status") => status(),
        Some("configure") => {
            let raw = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let payload: serde_json::Value =
                serde_json::from_str(raw).context("configure expects a JSON object")?;
            let result = charnoks_pos_lib::storage::store_backend_credentials(&payload)
                .map_err(|e| anyhow!(e))?;
            println!("{result}");
            Ok(())
        }
        Some("factory-reset") => {
            let result = charnoks_pos_lib::storage::factory_reset().map_err(|e| anyhow!(e))?;
            println!("{result}");
            Ok(())
        }
        Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

/// Probe backends once and print the health snapshot.
fn status() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let runtime = charnoks_pos_lib::open_default()?;
        runtime.start().await;
        let mut health =
            charnoks_pos_lib::diagnostics::get_system_health(&runtime).map_err(|e| anyhow!(e))?;
        health["about"] = charnoks_pos_lib::diagnostics::get_about_info();
        println!("{}", serde_json::to_string_pretty(&health)?);
        Ok::<(), anyhow::Error>(())
    })
}

//! Configure command - interactive first-run configuration wizard

use std::io::{self, Write};

use anyhow::Result;

/// Run the interactive configuration wizard, writing `config.toml` in the
/// current directory.
pub async fn run() -> Result<()> {
    println!("StellarStack Daemon Configuration Wizard");
    println!("=========================================\n");

    let web = prompt("HTTP listen address", "0.0.0.0:8080")?;
    let sftp = prompt("SFTP listen address", "0.0.0.0:5657")?;
    let auth_url = prompt("OAuth2 collaborator URL", "https://panel.example")?;
    let client_id = prompt("OAuth2 client id", "")?;
    let client_secret = prompt("OAuth2 client secret", "")?;
    let public_key_path = prompt("Path to the collaborator's RSA public key (PEM)", "public.pem")?;

    let public_key = std::fs::read_to_string(&public_key_path).unwrap_or_else(|_| {
        println!("  warning: could not read {}, leaving auth.publicKey blank", public_key_path);
        String::new()
    });

    let contents = format!(
        r#"debug = false

[listen]
web = "{web}"
sftp = "{sftp}"

[auth]
url = "{auth_url}"
clientId = "{client_id}"
clientSecret = "{client_secret}"
publicKey = """
{public_key}"""

[data]
servers = ".stellar/servers"
templates = ".stellar/templates"
cache = ".stellar/cache"
modules = ".stellar/modules"
logs = ".stellar/logs"
"#,
    );

    std::fs::write("config.toml", contents)?;
    println!("\nWrote config.toml. Run the daemon with --config config.toml.");
    Ok(())
}

fn prompt(label: &str, default: &str) -> Result<String> {
    if default.is_empty() {
        print!("{label}: ");
    } else {
        print!("{label} [{default}]: ");
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input.to_string())
    }
}

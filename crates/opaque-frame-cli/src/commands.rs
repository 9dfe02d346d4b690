//! Command implementations for the CLI.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use opaque_frame::{ProxyError, ProxyService};

/// Parses a `key=value` claim. The value is read as JSON when it parses,
/// otherwise kept as a string.
pub fn parse_claim(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("claim must be key=value, got {raw:?}");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("claim key is empty in {raw:?}");
    }

    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Issues a token and prints it with its iframe path.
pub fn issue(
    service: &ProxyService,
    origin: &str,
    ttl_secs: Option<u64>,
    claims: &[String],
) -> Result<()> {
    let extra = claims
        .iter()
        .map(|raw| parse_claim(raw))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let extra = (!extra.is_empty()).then_some(extra);

    let token = service
        .issue_token(origin, ttl_secs.map(Duration::from_secs), extra)
        .with_context(|| format!("Cannot issue a token for {origin}"))?;

    println!("{} {token}", "token:".bright_blue());
    println!("{} {}", "url:  ".bright_blue(), service.options().html_path(&token));
    Ok(())
}

/// Resolves a token and writes the resulting page to stdout.
pub async fn render(service: &ProxyService, token: &str) -> Result<()> {
    let result = service.resolve_token(token).await;

    eprintln!(
        "{} {} (cacheable: {})",
        "content-type:".bright_blue(),
        result.content_type,
        result.cacheable
    );
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(result.html.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Streams the image for `slug` to `output`, or stdout when `None`.
///
/// Ctrl-C cancels the copy.
pub async fn image(service: &ProxyService, slug: &str, output: Option<&Path>) -> Result<()> {
    let handle = match service.resolve_slug(slug).await {
        Ok(handle) => handle,
        Err(ProxyError::NotFound) => bail!("No image is mapped to slug {slug}"),
        Err(err) => return Err(err.into()),
    };

    eprintln!(
        "{} {} {}",
        "content-type:".bright_blue(),
        handle.content_type(),
        if handle.is_fallback() {
            "(placeholder)".yellow().to_string()
        } else {
            String::new()
        }
    );
    eprintln!(
        "{} public, max-age={}",
        "cache-control:".bright_blue(),
        handle.max_age().as_secs()
    );

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let copied = match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Cannot create {}", path.display()))?;
            let copied = handle.copy_to(&mut file, &cancel).await;
            file.flush().await?;
            copied
        }
        None => {
            let mut stdout = tokio::io::stdout();
            handle.copy_to(&mut stdout, &cancel).await
        }
    };
    ctrl_c.abort();

    match copied {
        Ok(total) => {
            eprintln!("{} {total} bytes", "done:".bright_green());
            Ok(())
        }
        Err(ProxyError::Cancelled) => {
            eprintln!("{}", "Interrupted".yellow());
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Prints the slug and image path for `url`.
pub fn slug(service: &ProxyService, url: &str) {
    let slug = service.slug_for(url);
    println!("{} {slug}", "slug:".bright_blue());
    println!("{} {}", "path:".bright_blue(), service.options().image_path(&slug));
}

/// Prints the route patterns the host application should mount.
pub fn routes(service: &ProxyService) {
    let options = service.options();
    println!("{} {}", "html: ".bright_blue(), options.html_route());
    println!("{} {}", "image:".bright_blue(), options.image_route());
}

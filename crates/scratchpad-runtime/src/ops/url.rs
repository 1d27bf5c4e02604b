//! WHATWG URL parsing for the guest `URL` class.

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object};
use serde::Serialize;
use url::Url;

#[derive(Debug, Serialize)]
pub struct UrlParts {
    pub href: String,
    pub origin: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl From<&Url> for UrlParts {
    fn from(url: &Url) -> Self {
        let prefixed = |prefix: &str, part: Option<&str>| match part {
            Some(p) if !p.is_empty() => format!("{prefix}{p}"),
            _ => String::new(),
        };
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{hostname}:{port}")
        };
        Self {
            href: url.as_str().to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: prefixed("?", url.query()),
            hash: prefixed("#", url.fragment()),
        }
    }
}

pub fn parse(input: &str, base: Option<&str>) -> Option<UrlParts> {
    let url = match base {
        Some(base) => Url::parse(base).ok()?.join(input).ok()?,
        None => Url::parse(input).ok()?,
    };
    Some(UrlParts::from(&url))
}

/// Apply a setter to `href`. Invalid values leave the URL unchanged.
pub fn set(href: &str, part: &str, value: &str) -> Option<UrlParts> {
    let mut url = Url::parse(href).ok()?;
    let trimmed = |prefix: char| value.strip_prefix(prefix).unwrap_or(value);
    match part {
        "protocol" => {
            let _ = url.set_scheme(value.trim_end_matches(':'));
        }
        "username" => {
            let _ = url.set_username(value);
        }
        "password" => {
            let _ = url.set_password(Some(value).filter(|v| !v.is_empty()));
        }
        "host" => match value.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                let _ = url.set_host(Some(host));
                let _ = url.set_port(port.parse().ok());
            }
            _ => {
                let _ = url.set_host(Some(value));
            }
        },
        "hostname" => {
            let _ = url.set_host(Some(value));
        }
        "port" => {
            let _ = url.set_port(if value.is_empty() { None } else { value.parse().ok() });
        }
        "pathname" => url.set_path(value),
        "search" => url.set_query(Some(trimmed('?')).filter(|v| !v.is_empty())),
        "hash" => url.set_fragment(Some(trimmed('#')).filter(|v| !v.is_empty())),
        "href" => url = Url::parse(value).ok()?,
        _ => return None,
    }
    Some(UrlParts::from(&url))
}

pub fn file_url_to_path(href: &str) -> Option<String> {
    Url::parse(href)
        .ok()?
        .to_file_path()
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

pub fn path_to_file_url(path: &str) -> Option<String> {
    Url::from_file_path(path).ok().map(String::from)
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "urlParse",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, input: String, base: Opt<String>| -> rquickjs::Result<Option<String>> {
                parse(&input, base.0.as_deref())
                    .map(|parts| serde_json::to_string(&parts))
                    .transpose()
                    .map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "urlSet",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, href: String, part: String, value: String| -> rquickjs::Result<Option<String>> {
                set(&href, &part, &value)
                    .map(|parts| serde_json::to_string(&parts))
                    .transpose()
                    .map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "fileUrlToPath",
        Function::new(ctx.clone(), |href: String| file_url_to_path(&href))?,
    )?;

    host.set(
        "pathToFileUrl",
        Function::new(ctx.clone(), |path: String| path_to_file_url(&path))?,
    )?;

    Ok(())
}

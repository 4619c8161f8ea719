//! HTTP surface: a thin warp routing layer over the site and add-on
//! operations.
//!
//! Authentication happens upstream; the caller's user id arrives in the
//! `x-user-id` header and doubles as the tenant id. Every failure is
//! answered with `{"error": "<message>"}` and the status of
//! [`Error::status_code`].

use std::convert::Infallible;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::addons::{addon_for, backup, github, mail, AddOnKind};
use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::helpers::validate_tenant_id;
use crate::site::{self, CreateSiteRequest, DeployRequest, LimitsPatch};
use crate::snapshots::{self, RestoreRequest};
use crate::tenant;

pub const USER_HEADER: &str = "x-user-id";

/// Body every purge route must carry.
pub const PURGE_CONFIRMATION: &str = "DELETE";

type Outcome = Result<(StatusCode, Value)>;

// ── Replies ─────────────────────────────────────────────────────────────────

fn ok<T: Serialize>(value: T) -> Outcome {
    Ok((StatusCode::OK, serde_json::to_value(value)?))
}

fn created<T: Serialize>(value: T) -> Outcome {
    Ok((StatusCode::CREATED, serde_json::to_value(value)?))
}

pub fn error_reply(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(%err, status = status.as_u16(), "request failed");
    } else {
        debug!(%err, status = status.as_u16(), "request rejected");
    }
    error_body(status, &err.to_string())
}

fn error_body(status: StatusCode, message: &str) -> Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
        .into_response()
}

fn respond(outcome: Outcome) -> std::result::Result<Response, Infallible> {
    Ok(match outcome {
        Ok((status, body)) => warp::reply::with_status(warp::reply::json(&body), status).into_response(),
        Err(e) => error_reply(&e),
    })
}

/// Turn warp's own rejections (unknown path, wrong method) into the JSON
/// error shape.
pub async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    if err.is_not_found() {
        return Ok(error_body(StatusCode::NOT_FOUND, "no such route"));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_body(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    warn!(?err, "unhandled rejection");
    Ok(error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}

// ── Request decoding ────────────────────────────────────────────────────────

fn caller(user: Option<String>) -> Result<String> {
    let user = user
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Unauthorized(format!("missing {USER_HEADER} header")))?;
    validate_tenant_id(&user)?;
    Ok(user)
}

fn site_ref(user: Option<String>, slug: &str) -> Result<SiteRef> {
    SiteRef::new(&caller(user)?, slug)
}

fn is_blank(body: &Bytes) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

fn body_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::validation(format!("invalid request body: {e}")))
}

fn body_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if is_blank(body) {
        Ok(T::default())
    } else {
        body_json(body)
    }
}

fn body_value(body: &Bytes) -> Result<Value> {
    body_or_default::<Option<Value>>(body).map(|v| v.unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct PurgeConfirmation {
    confirm: String,
}

/// Checked before anything is touched.
fn require_confirmation(body: &Bytes) -> Result<()> {
    match serde_json::from_slice::<PurgeConfirmation>(body) {
        Ok(c) if c.confirm == PURGE_CONFIRMATION => Ok(()),
        _ => Err(Error::validation(format!(
            "purge requires the body {{\"confirm\":\"{PURGE_CONFIRMATION}\"}}"
        ))),
    }
}

fn no_route(method: &str, path: &[&str]) -> Error {
    Error::not_found(format!("no route {method} /{}", path.join("/")))
}

fn addon_kind(family: &str, method: &str, path: &[&str]) -> Result<AddOnKind> {
    family.parse().map_err(|_| no_route(method, path))
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn create_site(
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let tenant_id = caller(user)?;
            let req: CreateSiteRequest = body_json(&body)?;
            // First site of a user provisions the tenant; later calls are no-ops.
            tenant::create_tenant(&ctx, &tenant_id).await?;
            created(site::create_site(&ctx, &tenant_id, &req).await?)
        }
        .await,
    )
}

async fn list_sites(ctx: Arc<Context>, user: Option<String>) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let tenant_id = caller(user)?;
            match site::list_tenant_sites(&ctx, &tenant_id).await {
                Err(Error::NotFound(_)) => ok(Vec::<Value>::new()),
                other => ok(other?),
            }
        }
        .await,
    )
}

async fn get_site(
    slug: String,
    ctx: Arc<Context>,
    user: Option<String>,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            ok(site::get_site(&ctx, &site).await?)
        }
        .await,
    )
}

async fn update_limits(
    slug: String,
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            let patch: LimitsPatch = body_or_default(&body)?;
            ok(site::update_site_limits(&ctx, &site, &patch).await?)
        }
        .await,
    )
}

async fn deploy_site(
    slug: String,
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            let req: DeployRequest = body_json(&body)?;
            ok(site::deploy_site(&ctx, &site, &req).await?)
        }
        .await,
    )
}

async fn delete_site(
    slug: String,
    ctx: Arc<Context>,
    user: Option<String>,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            site::delete_site(&ctx, &site).await?;
            ok(json!({ "deleted": site.slug }))
        }
        .await,
    )
}

async fn purge_site(
    slug: String,
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            require_confirmation(&body)?;
            ok(site::purge_site(&ctx, &site).await?)
        }
        .await,
    )
}

/// `GET /sites/{slug}/{a}/{b}`: add-on status, snapshot listing, mailbox
/// and alias listing.
async fn site_get(
    slug: String,
    a: String,
    b: String,
    ctx: Arc<Context>,
    user: Option<String>,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            let path = ["sites", slug.as_str(), a.as_str(), b.as_str()];
            match (a.as_str(), b.as_str()) {
                ("backup", "snapshots") => ok(snapshots::list_snapshots(&ctx, &site).await?),
                ("mail", "mailboxes") => ok(mail::list_mailboxes(&ctx, &site).await?),
                ("mail", "aliases") => ok(mail::list_aliases(&ctx, &site).await?),
                (family, "status") => {
                    let kind = addon_kind(family, "GET", &path)?;
                    ok(addon_for(kind).status(&ctx, &site).await?)
                }
                _ => Err(no_route("GET", &path)),
            }
        }
        .await,
    )
}

/// `POST /sites/{slug}/{a}/{b}`: add-on enable/disable/purge plus the
/// family-specific actions.
async fn site_post(
    slug: String,
    a: String,
    b: String,
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            let path = ["sites", slug.as_str(), a.as_str(), b.as_str()];
            match (a.as_str(), b.as_str()) {
                ("github", "dispatch") => {
                    ok(github::dispatch(&ctx, &site, &body_or_default(&body)?).await?)
                }
                ("backup", "run") => ok(backup::run_backup(&ctx, &site).await?),
                ("mail", "mailboxes") => {
                    created(mail::create_mailbox(&ctx, &site, &body_json(&body)?).await?)
                }
                ("mail", "aliases") => {
                    created(mail::create_alias(&ctx, &site, &body_json(&body)?).await?)
                }
                (family, action @ ("enable" | "disable" | "purge")) => {
                    let addon = addon_for(addon_kind(family, "POST", &path)?);
                    match action {
                        "enable" => ok(addon.enable(&ctx, &site, body_value(&body)?).await?),
                        "disable" => ok(addon.disable(&ctx, &site, body_value(&body)?).await?),
                        _ => {
                            require_confirmation(&body)?;
                            ok(addon.purge(&ctx, &site).await?)
                        }
                    }
                }
                _ => Err(no_route("POST", &path)),
            }
        }
        .await,
    )
}

/// `DELETE /sites/{slug}/{a}/{b}/{item}`: one mailbox, alias or snapshot.
async fn site_delete_item(
    slug: String,
    a: String,
    b: String,
    item: String,
    ctx: Arc<Context>,
    user: Option<String>,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            match (a.as_str(), b.as_str()) {
                ("mail", "mailboxes") => mail::delete_mailbox(&ctx, &site, &item).await?,
                ("mail", "aliases") => mail::delete_alias(&ctx, &site, &item).await?,
                ("backup", "snapshots") => snapshots::delete_snapshot(&ctx, &site, &item).await?,
                _ => {
                    let path = ["sites", slug.as_str(), a.as_str(), b.as_str(), item.as_str()];
                    return Err(no_route("DELETE", &path));
                }
            }
            ok(json!({ "deleted": item }))
        }
        .await,
    )
}

async fn restore_snapshot(
    slug: String,
    id: String,
    ctx: Arc<Context>,
    user: Option<String>,
    body: Bytes,
) -> std::result::Result<Response, Infallible> {
    respond(
        async {
            let site = site_ref(user, &slug)?;
            let req: RestoreRequest = body_or_default(&body)?;
            ok(snapshots::restore_snapshot(&ctx, &site, &id, req).await?)
        }
        .await,
    )
}

// ── Filters ─────────────────────────────────────────────────────────────────

/// Every route of the control plane. Compose with [`handle_rejection`] to
/// get JSON errors for unknown paths too.
pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Response,)> {
    let with_ctx = warp::any().map(move || ctx.clone());
    let user = warp::header::optional::<String>(USER_HEADER);
    let body = warp::body::bytes();

    let healthz = warp::get()
        .and(warp::path!("healthz"))
        .map(|| "ok".into_response());
    let readyz = warp::get()
        .and(warp::path!("readyz"))
        .map(|| "ok".into_response());

    let create = warp::post()
        .and(warp::path!("sites"))
        .and(with_ctx.clone())
        .and(user.clone())
        .and(body.clone())
        .and_then(create_site);
    let list = warp::get()
        .and(warp::path!("sites"))
        .and(with_ctx.clone())
        .and(user.clone())
        .and_then(list_sites);
    let get = warp::get()
        .and(warp::path!("sites" / String))
        .and(with_ctx.clone())
        .and(user.clone())
        .and_then(get_site);
    let limits = warp::patch()
        .and(warp::path!("sites" / String / "limits"))
        .and(with_ctx.clone())
        .and(user.clone())
        .and(body.clone())
        .and_then(update_limits);
    let deploy = warp::post()
        .and(warp::path!("sites" / String / "deploy"))
        .and(with_ctx.clone())
        .and(user.clone())
        .and(body.clone())
        .and_then(deploy_site);
    let delete = warp::delete()
        .and(warp::path!("sites" / String))
        .and(with_ctx.clone())
        .and(user.clone())
        .and_then(delete_site);
    let purge = warp::post()
        .and(warp::path!("sites" / String / "purge"))
        .and(with_ctx.clone())
        .and(user.clone())
        .and(body.clone())
        .and_then(purge_site);

    let sub_get = warp::get()
        .and(warp::path!("sites" / String / String / String))
        .and(with_ctx.clone())
        .and(user.clone())
        .and_then(site_get);
    let sub_post = warp::post()
        .and(warp::path!("sites" / String / String / String))
        .and(with_ctx.clone())
        .and(user.clone())
        .and(body.clone())
        .and_then(site_post);
    let sub_delete = warp::delete()
        .and(warp::path!("sites" / String / String / String / String))
        .and(with_ctx.clone())
        .and(user.clone())
        .and_then(site_delete_item);
    let restore = warp::post()
        .and(warp::path!("sites" / String / "backup" / "snapshots" / String / "restore"))
        .and(with_ctx)
        .and(user)
        .and(body)
        .and_then(restore_snapshot);

    healthz
        .or(readyz)
        .unify()
        .or(create)
        .unify()
        .or(list)
        .unify()
        .or(get)
        .unify()
        .or(limits)
        .unify()
        .or(deploy)
        .unify()
        .or(delete)
        .unify()
        .or(purge)
        .unify()
        .or(sub_get)
        .unify()
        .or(sub_post)
        .unify()
        .or(sub_delete)
        .unify()
        .or(restore)
        .unify()
        .boxed()
}

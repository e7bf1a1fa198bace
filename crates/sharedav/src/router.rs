//! Request routing with share-level permission filtering.
//!
//! The first segment of the cleaned request path names the share. Access
//! is decided before anything is dialed:
//!
//! | permission | read methods | mutating methods |
//! |------------|--------------|------------------|
//! | `None`     | 404          | 404              |
//! | `ReadOnly` | proxied      | 403              |
//! | `ReadWrite`| proxied      | proxied          |
//!
//! A share the principal cannot see answers exactly like a share that does
//! not exist. The root collection lists only visible shares.

use crate::backend::{empty_body, full_body, ProxyBody, ShareBackend};
use crate::error::BoxError;
use crate::remote::FileSystemForRemote;
use crate::share::{Permission, Permissions};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Methods that modify share contents.
pub const WRITE_METHODS: [&str; 9] = [
    "PUT", "POST", "COPY", "LOCK", "UNLOCK", "MKCOL", "MOVE", "PROPPATCH", "DELETE",
];

/// Methods the root collection answers.
const ROOT_ALLOW: &str = "OPTIONS, PROPFIND";

/// Whether `method` modifies share contents.
pub fn is_write_method(method: &Method) -> bool {
    WRITE_METHODS.contains(&method.as_str())
}

/// Split a request path into percent-decoded segments with `.` and `..`
/// resolved. The root path yields no segments.
pub fn clean_and_split(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for raw in path.split('/') {
        let segment = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |s| s.into_owned());
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(format!("{message}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn not_found() -> Response<ProxyBody> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

fn permission_denied() -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, "permission denied")
}

/// Dispatches requests to a fixed set of share backends.
///
/// Built per request from the backends the principal may see.
#[derive(Debug, Default)]
pub struct CompositeHandler {
    children: BTreeMap<String, Arc<ShareBackend>>,
}

impl CompositeHandler {
    /// Create a handler over `children`.
    pub fn new(children: BTreeMap<String, Arc<ShareBackend>>) -> Self {
        Self { children }
    }

    /// Names of the composed shares, in order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Handle a request.
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let segments = clean_and_split(req.uri().path());
        let Some(share_name) = segments.first() else {
            return self.handle_root(&req);
        };
        let Some(backend) = self.children.get(share_name) else {
            return not_found();
        };
        let backend = Arc::clone(backend);

        let sub_path = sub_path(&segments[1..], req.uri().path().ends_with('/'));
        let query = req.uri().query().map(str::to_string);
        let method = req.method().clone();

        match backend.round_trip(req, &sub_path, query.as_deref()).await {
            Ok(resp) => resp.map(|body| body.map_err(BoxError::from).boxed_unsync()),
            Err(e) => {
                warn!(share = %backend.name(), method = %method, error = %e, "Backend request failed");
                let status = e.status_code();
                text_response(status, status.canonical_reason().unwrap_or("bad gateway"))
            }
        }
    }

    fn handle_root(&self, req: &Request<ProxyBody>) -> Response<ProxyBody> {
        let method = req.method();
        if method.as_str() == "PROPFIND" {
            let depth_zero = req
                .headers()
                .get("depth")
                .is_some_and(|d| d.as_bytes() == b"0");
            return self.root_listing(depth_zero);
        }
        if method == Method::OPTIONS {
            return Response::builder()
                .status(StatusCode::OK)
                .header("dav", "1, 2")
                .header(header::ALLOW, ROOT_ALLOW)
                .body(empty_body())
                .unwrap_or_else(|_| Response::new(empty_body()));
        }
        if is_write_method(method) {
            return permission_denied();
        }
        let mut resp = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        resp.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static(ROOT_ALLOW));
        resp
    }

    fn root_listing(&self, depth_zero: bool) -> Response<ProxyBody> {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">\n",
        );
        push_collection(&mut xml, "/", "");
        if !depth_zero {
            for name in self.children.keys() {
                let href = format!("/{}/", urlencoding::encode(name));
                push_collection(&mut xml, &href, name);
            }
        }
        xml.push_str("</D:multistatus>\n");

        let mut resp = Response::new(full_body(Bytes::from(xml)));
        *resp.status_mut() = StatusCode::MULTI_STATUS;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        resp
    }
}

fn sub_path(rest: &[String], trailing_slash: bool) -> String {
    let mut path = String::new();
    for segment in rest {
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    if trailing_slash {
        path.push('/');
    }
    path
}

fn push_collection(xml: &mut String, href: &str, name: &str) {
    let _ = write!(
        xml,
        "<D:response><D:href>{}</D:href><D:propstat><D:prop>\
         <D:displayname>{}</D:displayname>\
         <D:resourcetype><D:collection/></D:resourcetype>\
         </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
        escape_xml(href),
        escape_xml(name)
    );
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

impl FileSystemForRemote {
    /// Serve a request on behalf of a principal with the given permissions.
    ///
    /// Requests for shares the principal has no access to are answered as
    /// not found; mutating requests on read-only shares are refused before
    /// any backend is contacted.
    pub async fn serve_http_with_perms<B>(
        &self,
        permissions: &dyn Permissions,
        req: Request<B>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let segments = clean_and_split(req.uri().path());
        if let Some(share_name) = segments.first() {
            match permissions.for_share(share_name) {
                Permission::None => {
                    trace!(share = %share_name, "No access to share");
                    return not_found();
                }
                Permission::ReadOnly if is_write_method(req.method()) => {
                    debug!(share = %share_name, method = %req.method(), "Write to read-only share refused");
                    return permission_denied();
                }
                _ => {}
            }
        }

        let generation = self.snapshot();
        let children = generation
            .backends()
            .iter()
            .filter(|(name, _)| permissions.for_share(name) != Permission::None)
            .map(|(name, backend)| (name.clone(), Arc::clone(backend)))
            .collect();
        drop(generation);

        let req = req.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync());
        CompositeHandler::new(children).handle(req).await
    }
}

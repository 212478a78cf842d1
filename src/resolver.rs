//! Static path discovery: walks route definitions inside worker 0, invokes
//! user-supplied path-generation callbacks, expands pagination and
//! de-duplicates the resulting pathnames.
//!
//! Callback results are cached in the `RouteCache` keyed by the *effective*
//! route, so two routes backed by the same generator (a redirect and its
//! target, a fallback and its origin) share one invocation, and a later
//! render of a dynamic page never re-runs the callback.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::cache::{PathItem, ResolvedPaths, RouteCache};
use crate::error::{Error, Result};
use crate::loader::RenderableModule;
use crate::route::{normalize_pathname, Params, RouteDefinition, RouteKind, StaticPath};

/// Pagination helper handed to path-generation callbacks.
///
/// `paginate` splits a data set into numbered pages and yields one raw
/// callback item per page; the chunk travels in `props.page` so the later
/// render can consume it without re-running the callback.
#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    page_size: usize,
}

impl Paginator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn paginate(&self, data: &[Value], param: &str) -> Vec<Value> {
        let total = data.len();
        let last_page = total.div_ceil(self.page_size).max(1);
        let mut pages = Vec::with_capacity(last_page);
        for current in 1..=last_page {
            let start = (current - 1) * self.page_size;
            let end = (start + self.page_size).min(total);
            pages.push(json!({
                "params": { param: current.to_string() },
                "props": {
                    "page": {
                        "data": &data[start..end],
                        "currentPage": current,
                        "lastPage": last_page,
                        "total": total,
                    }
                }
            }));
        }
        pages
    }
}

/// Resolver settings lifted from the worker's init payload
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub generate_fallback_pages: bool,
    pub page_size: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            generate_fallback_pages: true,
            page_size: 10,
        }
    }
}

/// Walk every prerendered route (and its fallback chain) and produce the
/// ordered list of concrete pages to build. Callback results are recorded
/// in `cache` as a side effect.
pub fn resolve_static_paths(
    routes: &[RouteDefinition],
    module: &dyn RenderableModule,
    options: &ResolveOptions,
    cache: &mut RouteCache,
) -> Result<Vec<StaticPath>> {
    let paginator = Paginator::new(options.page_size);
    let mut built: HashSet<String> = HashSet::new();
    let mut paths = Vec::new();
    for route in routes.iter().filter(|r| r.prerender) {
        visit_route(
            route, routes, module, options, &paginator, cache, &mut built, &mut paths,
        )?;
    }
    Ok(paths)
}

#[allow(clippy::too_many_arguments)]
fn visit_route(
    route: &RouteDefinition,
    all_routes: &[RouteDefinition],
    module: &dyn RenderableModule,
    options: &ResolveOptions,
    paginator: &Paginator,
    cache: &mut RouteCache,
    built: &mut HashSet<String>,
    paths: &mut Vec<StaticPath>,
) -> Result<()> {
    if matches!(route.kind, RouteKind::Fallback { .. }) && !options.generate_fallback_pages {
        return Ok(());
    }

    if let Some(pathname) = route.static_pathname() {
        // Static pathnames (including redirects and fallback pages) are
        // emitted directly, no callback involved.
        push_unique(paths, built, StaticPath {
            pathname,
            route_key: route.key(),
            params: Params::new(),
        });
    } else {
        let effective = effective_route(route, all_routes)?;
        let items = resolved_items(effective, module, paginator, cache)?;
        for item in items {
            let pathname = route.pathname_for(&item.params)?;
            push_unique(paths, built, StaticPath {
                pathname,
                route_key: route.key(),
                params: item.params,
            });
        }
    }

    for fallback in &route.fallback_routes {
        visit_route(
            fallback, all_routes, module, options, paginator, cache, built, paths,
        )?;
    }
    Ok(())
}

/// Invoke (or reuse) the effective route's path-generation callback.
fn resolved_items(
    effective: &RouteDefinition,
    module: &dyn RenderableModule,
    paginator: &Paginator,
    cache: &mut RouteCache,
) -> Result<ResolvedPaths> {
    let key = effective.key();
    if let Some(cached) = cache.get(&key) {
        return Ok(cached.clone());
    }
    let raw = module.static_paths(effective, paginator)?;
    let items = validate_path_items(effective, raw)?;
    cache.insert(key, items.clone());
    Ok(items)
}

/// The route whose callback answers for `route`: a redirect queries its
/// target, a fallback queries its non-fallback origin, anything else
/// queries itself.
pub(crate) fn effective_route<'a>(
    route: &'a RouteDefinition,
    all_routes: &'a [RouteDefinition],
) -> Result<&'a RouteDefinition> {
    match &route.kind {
        RouteKind::Page => Ok(route),
        RouteKind::Redirect { target } => find_route(all_routes, target).ok_or_else(|| {
            Error::ConfigError(format!(
                "redirect route '{}' points at unknown route '{}'",
                route.pattern, target
            ))
        }),
        RouteKind::Fallback { origin } => find_route(all_routes, origin).ok_or_else(|| {
            Error::ConfigError(format!(
                "fallback route '{}' has no non-fallback origin '{}'",
                route.pattern, origin
            ))
        }),
    }
}

fn find_route<'a>(routes: &'a [RouteDefinition], pattern: &str) -> Option<&'a RouteDefinition> {
    for route in routes {
        if route.pattern == pattern && !matches!(route.kind, RouteKind::Fallback { .. }) {
            return Some(route);
        }
        if let Some(found) = find_route(&route.fallback_routes, pattern) {
            return Some(found);
        }
    }
    None
}

/// Validate the shape of a raw callback result. Each item must be an object
/// with a `params` object of scalar values and an optional `props` field.
/// A malformed return is a fatal configuration error, never ignored.
pub(crate) fn validate_path_items(
    route: &RouteDefinition,
    raw: Vec<Value>,
) -> Result<ResolvedPaths> {
    let mut items = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        let object = value
            .as_object()
            .ok_or_else(|| malformed(route, index, "expected an object with a `params` field"))?;
        let params_value = object
            .get("params")
            .ok_or_else(|| malformed(route, index, "missing `params`"))?;
        let params_object = params_value
            .as_object()
            .ok_or_else(|| malformed(route, index, "`params` must be an object"))?;

        let mut params = Params::new();
        for (name, value) in params_object {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(malformed(
                        route,
                        index,
                        &format!("param `{name}` must be a string, number or boolean"),
                    ))
                }
            };
            params.insert(name.clone(), text);
        }

        items.push(PathItem {
            params,
            props: object.get("props").cloned(),
        });
    }
    Ok(items)
}

fn malformed(route: &RouteDefinition, index: usize, why: &str) -> Error {
    Error::ConfigError(format!(
        "invalid static path entry #{index} for route '{}': {why}",
        route.pattern
    ))
}

fn push_unique(paths: &mut Vec<StaticPath>, built: &mut HashSet<String>, path: StaticPath) {
    if built.insert(normalize_pathname(&path.pathname)) {
        paths.push(path);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::loader::{FnModule, RenderedPage};

    fn id_module(ids: Vec<&'static str>) -> FnModule {
        FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x"))).with_static_paths(move |_, _| {
            Ok(ids
                .iter()
                .map(|id| json!({ "params": { "id": id } }))
                .collect())
        })
    }

    #[test]
    fn static_then_dynamic_expansion_order() {
        let routes = vec![
            RouteDefinition::page("/about", "about"),
            RouteDefinition::page("/blog/[id]", "blog"),
        ];
        let module = id_module(vec!["1", "2", "3"]);
        let mut cache = RouteCache::new();
        let paths =
            resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache).unwrap();
        let names: Vec<&str> = paths.iter().map(|p| p.pathname.as_str()).collect();
        assert_eq!(names, vec!["/about", "/blog/1", "/blog/2", "/blog/3"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_pathnames_collapse_across_routes() {
        // Two routes that both produce /blog/5, one via params and one via
        // a fallback chain backed by the same origin.
        let mut primary = RouteDefinition::page("/blog/[id]", "blog");
        let mut fallback = RouteDefinition::page("/blog/[id]", "blog");
        fallback.kind = RouteKind::Fallback {
            origin: "/blog/[id]".into(),
        };
        primary.fallback_routes.push(fallback);
        let routes = vec![primary];
        let module = id_module(vec!["5"]);
        let mut cache = RouteCache::new();
        let paths =
            resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].pathname, "/blog/5");
    }

    #[test]
    fn trailing_slash_variants_deduplicate() {
        let routes = vec![
            RouteDefinition::page("/about", "a"),
            RouteDefinition::page("/about/", "b"),
        ];
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x")));
        let mut cache = RouteCache::new();
        let paths =
            resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache).unwrap();
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn callback_invoked_once_per_effective_route() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x"))).with_static_paths(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![json!({ "params": { "id": "1" } })])
            },
        );

        let target = RouteDefinition::page("/blog/[id]", "blog");
        let mut redirect = RouteDefinition::page("/posts/[id]", "blog");
        redirect.kind = RouteKind::Redirect {
            target: "/blog/[id]".into(),
        };
        let routes = vec![target, redirect];
        let mut cache = RouteCache::new();
        let paths =
            resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let names: Vec<&str> = paths.iter().map(|p| p.pathname.as_str()).collect();
        assert_eq!(names, vec!["/blog/1", "/posts/1"]);
    }

    #[test]
    fn fallback_pages_skipped_when_disabled() {
        let mut primary = RouteDefinition::page("/about", "about");
        let mut fallback = RouteDefinition::page("/fr/about", "about");
        fallback.kind = RouteKind::Fallback {
            origin: "/about".into(),
        };
        primary.fallback_routes.push(fallback);
        let routes = vec![primary];
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x")));
        let mut cache = RouteCache::new();

        let options = ResolveOptions {
            generate_fallback_pages: false,
            ..ResolveOptions::default()
        };
        let paths = resolve_static_paths(&routes, &module, &options, &mut cache).unwrap();
        assert_eq!(paths.len(), 1);

        let options = ResolveOptions::default();
        let paths = resolve_static_paths(&routes, &module, &options, &mut cache).unwrap();
        let names: Vec<&str> = paths.iter().map(|p| p.pathname.as_str()).collect();
        assert_eq!(names, vec!["/about", "/fr/about"]);
    }

    #[test]
    fn malformed_callback_shape_is_fatal() {
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x")))
            .with_static_paths(|_, _| Ok(vec![json!({ "id": "1" })]));
        let routes = vec![RouteDefinition::page("/blog/[id]", "blog")];
        let mut cache = RouteCache::new();
        let err = resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(err.to_string().contains("missing `params`"));
        // The failed route must not leave a partial cache entry behind.
        assert!(cache.is_empty());
    }

    #[test]
    fn non_prerender_routes_are_ignored() {
        let mut ssr = RouteDefinition::page("/api/data", "api");
        ssr.prerender = false;
        let routes = vec![ssr, RouteDefinition::page("/about", "about")];
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x")));
        let mut cache = RouteCache::new();
        let paths =
            resolve_static_paths(&routes, &module, &ResolveOptions::default(), &mut cache).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].pathname, "/about");
    }

    #[test]
    fn paginator_splits_and_numbers_pages() {
        let paginator = Paginator::new(2);
        let data: Vec<Value> = (1..=5).map(|n| json!(n)).collect();
        let pages = paginator.paginate(&data, "page");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0]["params"]["page"], "1");
        assert_eq!(pages[2]["params"]["page"], "3");
        assert_eq!(pages[1]["props"]["page"]["data"], json!([3, 4]));
        assert_eq!(pages[2]["props"]["page"]["lastPage"], 3);
        assert_eq!(pages[2]["props"]["page"]["total"], 5);
    }

    #[test]
    fn paginator_yields_one_empty_page_for_no_data() {
        let pages = Paginator::new(10).paginate(&[], "page");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0]["props"]["page"]["data"], json!([]));
    }

    #[test]
    fn paginated_route_expands_through_resolver() {
        let module = FnModule::new(|_, _, _, _| Ok(RenderedPage::html("x"))).with_static_paths(
            |_, paginate| {
                let data: Vec<Value> = (1..=5).map(|n| json!(n)).collect();
                Ok(paginate.paginate(&data, "page"))
            },
        );
        let routes = vec![RouteDefinition::page("/blog/[page]", "blog")];
        let mut cache = RouteCache::new();
        let options = ResolveOptions {
            page_size: 2,
            ..ResolveOptions::default()
        };
        let paths = resolve_static_paths(&routes, &module, &options, &mut cache).unwrap();
        let names: Vec<&str> = paths.iter().map(|p| p.pathname.as_str()).collect();
        assert_eq!(names, vec!["/blog/1", "/blog/2", "/blog/3"]);
        // Props were cached alongside the params for later renders.
        let items = cache.get(&routes[0].key()).unwrap();
        assert!(items[0].props.as_ref().unwrap()["page"]["data"].is_array());
    }
}

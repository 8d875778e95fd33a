//! Request classification into caching strategies.

use crate::config::RouteConfig;
use crate::http::Request;

/// What kind of resource a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Backend JSON endpoints
  Api,
  /// Stylesheets, scripts, images
  StaticAsset,
  /// Pages and anything else
  Document,
}

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
}

impl RequestClass {
  pub fn strategy(self) -> Strategy {
    match self {
      Self::StaticAsset => Strategy::CacheFirst,
      Self::Api | Self::Document => Strategy::NetworkFirst,
    }
  }
}

/// Classifies requests by URL path.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  api_prefix: String,
  static_prefix: String,
}

impl StrategySelector {
  pub fn new(routes: &RouteConfig) -> Self {
    Self {
      api_prefix: routes.api_prefix.clone(),
      static_prefix: routes.static_prefix.clone(),
    }
  }

  /// Classify a request. Non-GET requests are never intercepted and yield `None`.
  ///
  /// API paths win over static paths when both markers appear. Only the URL
  /// path is inspected, so `/?asset=/static/x` is a Document rather than a
  /// static asset: query strings are caller data and must not pick the
  /// strategy.
  pub fn classify(&self, request: &Request) -> Option<RequestClass> {
    if !request.is_cacheable() {
      return None;
    }

    let path = request.url.path();
    let class = if path.contains(&self.api_prefix) {
      RequestClass::Api
    } else if path.contains(&self.static_prefix) {
      RequestClass::StaticAsset
    } else {
      RequestClass::Document
    };
    Some(class)
  }

  pub fn select(&self, request: &Request) -> Option<Strategy> {
    self.classify(request).map(RequestClass::strategy)
  }
}

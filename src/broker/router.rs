//! Pattern trie for topic routing.
//!
//! A compressed radix trie keyed by longest common prefix, generic over the
//! handler value type and independent of any HTTP machinery. Patterns are
//! split into static, `:param`, and trailing-`*` wildcard segments at
//! registration; lookup matches static children first, then the param child,
//! then the wildcard child, backtracking to the parent's next priority class
//! on a dead end.
//!
//! The trie is built once at startup and read-only afterwards. Parameter
//! values are extracted positionally into a caller-reused buffer sized to
//! the largest registered parameter count, keeping the subscribe/publish
//! hot path allocation-light.

use std::fmt;
use std::sync::Arc;

/// Routing method for a registered handler.
///
/// One trie node may carry up to four handlers, one per method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Publisher started while the topic has at least one subscriber.
    Pub,
    /// Subscription authorization.
    Sub,
    /// Unsubscription hook.
    Unsub,
    /// Inbound/relayed message processing.
    Msg,
}

impl Method {
    fn index(self) -> usize {
        match self {
            Method::Pub => 0,
            Method::Sub => 1,
            Method::Unsub => 2,
            Method::Msg => 3,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Pub => "PUB",
            Method::Sub => "SUB",
            Method::Unsub => "UNSUB",
            Method::Msg => "MSG",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Static,
    Param,
    Any,
}

const PARAM_LABEL: u8 = b':';
const ANY_LABEL: u8 = b'*';

/// A registered route: method, pristine pattern, and registration name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: String,
    pub name: String,
}

/// Result of a lookup: the matched handler (if the matched node carries one
/// for the requested method), the pristine pattern, and its parameter names.
///
/// `handler` is `None` both when no pattern matched and when a pattern
/// matched without a handler for the requested method; the two cases are
/// deliberately indistinguishable.
pub struct RouteMatch<H> {
    pub handler: Option<H>,
    pub path: Arc<str>,
    pub pnames: Arc<[String]>,
}

struct Node<H> {
    kind: Kind,
    label: u8,
    prefix: Vec<u8>,
    parent: Option<usize>,
    static_children: Vec<usize>,
    param_child: Option<usize>,
    any_child: Option<usize>,
    /// Pristine registered pattern, set on handler-carrying nodes.
    ppath: Arc<str>,
    pnames: Arc<[String]>,
    handlers: [Option<H>; 4],
}

impl<H> Node<H> {
    fn new(
        kind: Kind,
        prefix: Vec<u8>,
        parent: Option<usize>,
        ppath: Arc<str>,
        pnames: Arc<[String]>,
    ) -> Self {
        Self {
            kind,
            label: prefix.first().copied().unwrap_or(0),
            prefix,
            parent,
            static_children: Vec::new(),
            param_child: None,
            any_child: None,
            ppath,
            pnames,
            handlers: [None, None, None, None],
        }
    }

    fn is_handler(&self) -> bool {
        self.handlers.iter().any(Option::is_some)
    }

    fn is_leaf(&self) -> bool {
        self.static_children.is_empty() && self.param_child.is_none() && self.any_child.is_none()
    }
}

/// Registry of routes for subscription matching and topic parameter parsing.
pub struct Router<H> {
    nodes: Vec<Node<H>>,
    routes: Vec<Route>,
    max_params: usize,
}

impl<H: Clone> Router<H> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(
                Kind::Static,
                Vec::new(),
                None,
                Arc::from(""),
                Arc::from(Vec::new()),
            )],
            routes: Vec::new(),
            max_params: 0,
        }
    }

    /// Largest parameter count across all registered patterns; callers size
    /// their reusable value buffer to this.
    pub fn max_params(&self) -> usize {
        self.max_params
    }

    /// All registered routes, in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Register a handler for a (method, pattern) pair.
    ///
    /// `:name` segments capture one slash-delimited segment; a trailing `*`
    /// captures the remainder verbatim. `\:` escapes a literal colon.
    /// Registration is not thread-safe and happens once at startup.
    pub fn add(&mut self, method: Method, pattern: &str, name: &str, handler: H) -> Route {
        let mut path = pattern.to_owned();
        if path.is_empty() {
            path.push('/');
        }
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let ppath: Arc<str> = Arc::from(path.as_str());
        let mut pnames: Vec<String> = Vec::new();

        let mut i = 0;
        while i < path.len() {
            let b = path.as_bytes()[i];
            if b == PARAM_LABEL {
                if i > 0 && path.as_bytes()[i - 1] == b'\\' {
                    // Escaped colon: drop the backslash and treat the colon
                    // as a literal.
                    path.remove(i - 1);
                    continue;
                }
                let j = i + 1;
                let head = path.as_bytes()[..i].to_vec();
                self.insert(method, &head, None, Kind::Static, Arc::from(""), &[]);
                let mut k = i;
                while k < path.len() && path.as_bytes()[k] != b'/' {
                    k += 1;
                }
                pnames.push(path[j..k].to_owned());
                path = format!("{}{}", &path[..j], &path[k..]);
                i = j;
                let head = path.as_bytes()[..i].to_vec();
                if i == path.len() {
                    self.insert(
                        method,
                        &head,
                        Some(handler.clone()),
                        Kind::Param,
                        ppath.clone(),
                        &pnames,
                    );
                } else {
                    self.insert(method, &head, None, Kind::Param, Arc::from(""), &[]);
                }
            } else if b == ANY_LABEL {
                let head = path.as_bytes()[..i].to_vec();
                self.insert(method, &head, None, Kind::Static, Arc::from(""), &[]);
                pnames.push("*".to_owned());
                let head = path.as_bytes()[..=i].to_vec();
                self.insert(
                    method,
                    &head,
                    Some(handler.clone()),
                    Kind::Any,
                    ppath.clone(),
                    &pnames,
                );
            }
            i += 1;
        }

        let full = path.as_bytes().to_vec();
        self.insert(
            method,
            &full,
            Some(handler),
            Kind::Static,
            ppath.clone(),
            &pnames,
        );

        let route = Route {
            method,
            path: ppath.to_string(),
            name: if name.is_empty() {
                ppath.to_string()
            } else {
                name.to_owned()
            },
        };
        self.routes.push(route.clone());
        route
    }

    fn insert(
        &mut self,
        method: Method,
        path: &[u8],
        handler: Option<H>,
        kind: Kind,
        ppath: Arc<str>,
        pnames: &[String],
    ) {
        if pnames.len() > self.max_params {
            self.max_params = pnames.len();
        }

        let mut current = 0usize;
        let mut search = path.to_vec();
        loop {
            let prefix_len = self.nodes[current].prefix.len();
            let search_len = search.len();
            let max = prefix_len.min(search_len);
            let mut lcp = 0;
            while lcp < max && search[lcp] == self.nodes[current].prefix[lcp] {
                lcp += 1;
            }

            if lcp == 0 {
                // Only the root has an empty prefix.
                let node = &mut self.nodes[current];
                node.label = search.first().copied().unwrap_or(0);
                node.prefix = search.clone();
                if let Some(h) = handler {
                    node.kind = kind;
                    node.handlers[method.index()] = Some(h);
                    node.ppath = ppath;
                    node.pnames = pnames.to_vec().into();
                }
                return;
            }

            if lcp < prefix_len {
                // Split: the existing node's tail moves into a new child.
                let child_idx = self.nodes.len();
                let (tail, moved_static, moved_param, moved_any, moved_ppath, moved_pnames, moved_handlers, old_kind) = {
                    let node = &mut self.nodes[current];
                    (
                        node.prefix.split_off(lcp),
                        std::mem::take(&mut node.static_children),
                        node.param_child.take(),
                        node.any_child.take(),
                        std::mem::replace(&mut node.ppath, Arc::from("")),
                        std::mem::replace(&mut node.pnames, Arc::from(Vec::new())),
                        std::mem::replace(&mut node.handlers, [None, None, None, None]),
                        node.kind,
                    )
                };
                let mut split = Node::new(old_kind, tail, Some(current), moved_ppath, moved_pnames);
                split.static_children = moved_static;
                split.param_child = moved_param;
                split.any_child = moved_any;
                split.handlers = moved_handlers;
                self.nodes.push(split);
                let reparent: Vec<usize> = self.nodes[child_idx]
                    .static_children
                    .iter()
                    .copied()
                    .chain(self.nodes[child_idx].param_child)
                    .chain(self.nodes[child_idx].any_child)
                    .collect();
                for idx in reparent {
                    self.nodes[idx].parent = Some(child_idx);
                }

                {
                    let node = &mut self.nodes[current];
                    node.kind = Kind::Static;
                    node.label = node.prefix[0];
                    node.static_children.push(child_idx);
                }

                if lcp == search_len {
                    // The truncated node is the insertion point.
                    let node = &mut self.nodes[current];
                    node.kind = kind;
                    if let Some(h) = handler {
                        node.handlers[method.index()] = Some(h);
                    }
                    node.ppath = ppath;
                    node.pnames = pnames.to_vec().into();
                } else {
                    let mut child = Node::new(
                        kind,
                        search[lcp..].to_vec(),
                        Some(current),
                        ppath,
                        pnames.to_vec().into(),
                    );
                    if let Some(h) = handler {
                        child.handlers[method.index()] = Some(h);
                    }
                    let idx = self.nodes.len();
                    self.nodes.push(child);
                    self.nodes[current].static_children.push(idx);
                }
                return;
            }

            if lcp < search_len {
                search.drain(..lcp);
                if let Some(child) = self.find_child_with_label(current, search[0]) {
                    current = child;
                    continue;
                }
                let mut child = Node::new(
                    kind,
                    search.clone(),
                    Some(current),
                    ppath,
                    pnames.to_vec().into(),
                );
                if let Some(h) = handler {
                    child.handlers[method.index()] = Some(h);
                }
                let idx = self.nodes.len();
                self.nodes.push(child);
                match kind {
                    Kind::Static => self.nodes[current].static_children.push(idx),
                    Kind::Param => self.nodes[current].param_child = Some(idx),
                    Kind::Any => self.nodes[current].any_child = Some(idx),
                }
                return;
            }

            // Node already exists.
            if let Some(h) = handler {
                let node = &mut self.nodes[current];
                node.handlers[method.index()] = Some(h);
                node.ppath = ppath;
                if node.pnames.is_empty() {
                    node.pnames = pnames.to_vec().into();
                }
            }
            return;
        }
    }

    fn find_static_child(&self, node: usize, label: u8) -> Option<usize> {
        self.nodes[node]
            .static_children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].label == label)
    }

    fn find_child_with_label(&self, node: usize, label: u8) -> Option<usize> {
        if let Some(c) = self.find_static_child(node, label) {
            return Some(c);
        }
        if label == PARAM_LABEL {
            return self.nodes[node].param_child;
        }
        if label == ANY_LABEL {
            return self.nodes[node].any_child;
        }
        None
    }

    /// Resolve a concrete topic for a method.
    ///
    /// Parameter values are written positionally into `pvalues`, which is
    /// grown to [`Router::max_params`] and reused across calls. Never
    /// panics; an unmatched topic yields a `RouteMatch` without a handler.
    pub fn find(&self, method: Method, topic: &str, pvalues: &mut Vec<String>) -> RouteMatch<H> {
        if pvalues.len() < self.max_params {
            pvalues.resize(self.max_params, String::new());
        }

        let path = topic.as_bytes();
        let mut current = 0usize;
        let mut best: Option<usize> = None;
        let mut matched: Option<H> = None;
        let mut search_index = 0usize;
        let mut param_index = 0usize;

        // Re-entry point after backtracking: which priority class to try
        // next at the current node.
        #[derive(PartialEq, Clone, Copy)]
        enum Entry {
            Full,
            Param,
            Any,
        }
        let mut entry = Entry::Full;

        'walk: loop {
            if entry == Entry::Full {
                let node = &self.nodes[current];
                let mut prefix_len = 0;
                let mut lcp = 0;
                if node.kind == Kind::Static {
                    let search = &path[search_index..];
                    prefix_len = node.prefix.len();
                    let max = prefix_len.min(search.len());
                    while lcp < max && search[lcp] == node.prefix[lcp] {
                        lcp += 1;
                    }
                }

                if lcp != prefix_len {
                    match self.backtrack(
                        &mut current,
                        &mut search_index,
                        &mut param_index,
                        pvalues,
                        Kind::Static,
                    ) {
                        Some(Kind::Param) => {
                            entry = Entry::Param;
                            continue 'walk;
                        }
                        _ => break 'walk,
                    }
                }

                search_index += lcp;
                let search = &path[search_index..];

                if search.is_empty() && self.nodes[current].is_handler() {
                    if best.is_none() {
                        best = Some(current);
                    }
                    if let Some(h) = &self.nodes[current].handlers[method.index()] {
                        matched = Some(h.clone());
                        break 'walk;
                    }
                }

                if !search.is_empty() {
                    if let Some(child) = self.find_static_child(current, search[0]) {
                        current = child;
                        continue 'walk;
                    }
                }
            }

            if entry == Entry::Full || entry == Entry::Param {
                let search = &path[search_index..];
                if !search.is_empty() {
                    if let Some(child) = self.nodes[current].param_child {
                        current = child;
                        // A leaf param node consumes the whole remainder,
                        // acting like a wildcard.
                        let l = if self.nodes[current].is_leaf() {
                            search.len()
                        } else {
                            search
                                .iter()
                                .position(|&b| b == b'/')
                                .unwrap_or(search.len())
                        };
                        pvalues[param_index] =
                            String::from_utf8_lossy(&search[..l]).into_owned();
                        param_index += 1;
                        search_index += l;
                        entry = Entry::Full;
                        continue 'walk;
                    }
                }
            }

            if let Some(child) = self.nodes[current].any_child {
                current = child;
                let search = &path[search_index..];
                let node = &self.nodes[current];
                if !node.pnames.is_empty() {
                    pvalues[node.pnames.len() - 1] =
                        String::from_utf8_lossy(search).into_owned();
                }
                param_index += 1;
                search_index += search.len();
                if best.is_none() {
                    best = Some(current);
                }
                if let Some(h) = &node.handlers[method.index()] {
                    matched = Some(h.clone());
                    break 'walk;
                }
            }

            match self.backtrack(
                &mut current,
                &mut search_index,
                &mut param_index,
                pvalues,
                Kind::Any,
            ) {
                Some(Kind::Param) => entry = Entry::Param,
                Some(Kind::Any) => entry = Entry::Any,
                _ => break 'walk,
            }
        }

        if let Some(h) = matched {
            let node = &self.nodes[current];
            return RouteMatch {
                handler: Some(h),
                path: node.ppath.clone(),
                pnames: node.pnames.clone(),
            };
        }
        if let Some(b) = best {
            // A pattern matched but carries no handler for this method;
            // reported identically to an unmatched topic.
            let node = &self.nodes[b];
            return RouteMatch {
                handler: None,
                path: node.ppath.clone(),
                pnames: node.pnames.clone(),
            };
        }
        RouteMatch {
            handler: None,
            path: Arc::from(""),
            pnames: Arc::from(Vec::new()),
        }
    }

    /// Step back to the parent and report the next priority class to try
    /// there. Restores consumed search/parameter state unless backtracking
    /// out of a failed static-prefix comparison (which consumed nothing).
    fn backtrack(
        &self,
        current: &mut usize,
        search_index: &mut usize,
        param_index: &mut usize,
        pvalues: &mut [String],
        from: Kind,
    ) -> Option<Kind> {
        let previous = &self.nodes[*current];
        let next_kind = match previous.kind {
            Kind::Static => Kind::Param,
            Kind::Param => Kind::Any,
            Kind::Any => Kind::Static,
        };

        if from != Kind::Static {
            if previous.kind == Kind::Static {
                *search_index -= previous.prefix.len();
            } else {
                *param_index -= 1;
                *search_index -= pvalues[*param_index].len();
                pvalues[*param_index].clear();
            }
        }

        let parent = previous.parent?;
        *current = parent;
        if next_kind == Kind::Static {
            // Backtracked out of a wildcard: nothing left to try.
            return None;
        }
        Some(next_kind)
    }
}

impl<H: Clone> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router_with(routes: &[(Method, &str)]) -> Router<usize> {
        let mut router = Router::new();
        for (i, (method, pattern)) in routes.iter().enumerate() {
            router.add(*method, pattern, "", i);
        }
        router
    }

    fn find(router: &Router<usize>, method: Method, topic: &str) -> (Option<usize>, Vec<String>) {
        let mut pvalues = Vec::new();
        let m = router.find(method, topic, &mut pvalues);
        let values = m
            .pnames
            .iter()
            .enumerate()
            .map(|(i, _)| pvalues[i].clone())
            .collect();
        (m.handler, values)
    }

    #[test]
    fn static_topic_matches() {
        let router = router_with(&[(Method::Sub, "/networks")]);
        let (h, _) = find(&router, Method::Sub, "/networks");
        assert_eq!(h, Some(0));
    }

    #[test]
    fn unmatched_topic_returns_no_handler() {
        let router = router_with(&[(Method::Sub, "/networks")]);
        let (h, _) = find(&router, Method::Sub, "/devices");
        assert_eq!(h, None);
    }

    #[test]
    fn wrong_method_is_indistinguishable_from_not_found() {
        let router = router_with(&[(Method::Sub, "/networks")]);
        let (h, _) = find(&router, Method::Pub, "/networks");
        assert_eq!(h, None);
    }

    #[test]
    fn param_segment_is_extracted() {
        let router = router_with(&[(Method::Sub, "/networks/:id/devices")]);
        let mut pvalues = Vec::new();
        let m = router.find(Method::Sub, "/networks/8056c2e21c000001/devices", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(m.pnames.as_ref(), ["id".to_string()]);
        assert_eq!(pvalues[0], "8056c2e21c000001");
    }

    #[test]
    fn multiple_params_are_extracted_positionally() {
        let router = router_with(&[(Method::Msg, "/networks/:id/devices/:address")]);
        let mut pvalues = Vec::new();
        let m = router.find(Method::Msg, "/networks/net1/devices/dev2", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(pvalues[0], "net1");
        assert_eq!(pvalues[1], "dev2");
    }

    #[test]
    fn wildcard_captures_remainder_verbatim() {
        let router = router_with(&[(Method::Sub, "/files/*")]);
        let mut pvalues = Vec::new();
        let m = router.find(Method::Sub, "/files/a/b/c", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(pvalues[0], "a/b/c");
    }

    #[test]
    fn static_wins_over_param() {
        let router = router_with(&[
            (Method::Sub, "/networks/all"),
            (Method::Sub, "/networks/:id"),
        ]);
        let (h, _) = find(&router, Method::Sub, "/networks/all");
        assert_eq!(h, Some(0));
        let (h, values) = find(&router, Method::Sub, "/networks/n1");
        assert_eq!(h, Some(1));
        assert_eq!(values, ["n1"]);
    }

    #[test]
    fn param_wins_over_wildcard() {
        let router = router_with(&[(Method::Sub, "/a/:x"), (Method::Sub, "/a/*")]);
        let (h, _) = find(&router, Method::Sub, "/a/one");
        assert_eq!(h, Some(0));
        // The wildcard still catches deeper topics the param can't.
        let (h, _) = find(&router, Method::Sub, "/a/one/two");
        assert_eq!(h, Some(1));
    }

    #[test]
    fn dead_end_backtracks_to_param_sibling() {
        let router = router_with(&[(Method::Sub, "/a/b/c"), (Method::Sub, "/a/:x/d")]);
        let (h, values) = find(&router, Method::Sub, "/a/b/d");
        assert_eq!(h, Some(1));
        assert_eq!(values, ["b"]);
    }

    #[test]
    fn backtracked_param_value_is_cleared() {
        let router = router_with(&[(Method::Sub, "/a/:x/d"), (Method::Sub, "/a/*")]);
        let mut pvalues = Vec::new();
        let m = router.find(Method::Sub, "/a/b/e", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(m.pnames.as_ref(), ["*".to_string()]);
        assert_eq!(pvalues[0], "b/e");
    }

    #[test]
    fn same_pattern_carries_handlers_for_all_methods() {
        let mut router: Router<usize> = Router::new();
        router.add(Method::Pub, "/t/:id", "", 0);
        router.add(Method::Sub, "/t/:id", "", 1);
        router.add(Method::Unsub, "/t/:id", "", 2);
        router.add(Method::Msg, "/t/:id", "", 3);

        for (method, expected) in [
            (Method::Pub, 0),
            (Method::Sub, 1),
            (Method::Unsub, 2),
            (Method::Msg, 3),
        ] {
            let (h, _) = find(&router, method, "/t/x");
            assert_eq!(h, Some(expected));
        }
        assert_eq!(router.routes().len(), 4);
    }

    #[test]
    fn escaped_colon_is_a_literal() {
        let router = router_with(&[(Method::Sub, "/time/12\\:00")]);
        let (h, _) = find(&router, Method::Sub, "/time/12:00");
        assert_eq!(h, Some(0));
        assert_eq!(router.max_params(), 0);
    }

    #[test]
    fn pattern_without_leading_slash_is_normalized() {
        let router = router_with(&[(Method::Sub, "networks")]);
        let (h, _) = find(&router, Method::Sub, "/networks");
        assert_eq!(h, Some(0));
    }

    #[test]
    fn pvalues_buffer_is_reused_across_finds() {
        let router = router_with(&[(Method::Sub, "/a/:x"), (Method::Sub, "/b/:y/:z")]);
        let mut pvalues = Vec::new();

        let m = router.find(Method::Sub, "/b/1/2", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(&pvalues[..2], ["1".to_string(), "2".to_string()]);

        let m = router.find(Method::Sub, "/a/7", &mut pvalues);
        assert!(m.handler.is_some());
        assert_eq!(pvalues[0], "7");
    }

    proptest! {
        #[test]
        fn registered_static_routes_are_always_found(
            segments in proptest::collection::vec("[a-z]{1,8}", 1..4)
        ) {
            let pattern = format!("/{}", segments.join("/"));
            let router = router_with(&[(Method::Sub, &pattern)]);
            let (h, _) = find(&router, Method::Sub, &pattern);
            prop_assert_eq!(h, Some(0));
        }

        #[test]
        fn arbitrary_topics_never_panic(topic in "/[a-z/:*]{0,24}") {
            let router = router_with(&[
                (Method::Sub, "/networks/:id/devices"),
                (Method::Sub, "/files/*"),
                (Method::Pub, "/networks/all"),
            ]);
            let mut pvalues = Vec::new();
            let _ = router.find(Method::Sub, &topic, &mut pvalues);
            let _ = router.find(Method::Pub, &topic, &mut pvalues);
        }
    }
}

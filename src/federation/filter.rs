//! Per-user content filters
//!
//! Filters are loaded from the store and compiled once per cache fill.
//! A user's cache entry flushes itself shortly after the earliest expiry
//! among that user's filters so expired rules stop applying without polling.

use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::data::{Database, Filter, Post, origin_of};
use crate::error::AppError;

/// Delay past the earliest expiry before a cache entry flushes itself.
const EXPIRY_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterAction {
    Reject,
    SkipMedia,
    Hide,
    Collapse,
    Rewrite,
}

/// Which part of a post a text predicate matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Summary,
    Body,
    AttachmentDescription,
}

/// Why a filter matched, for audit logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCause {
    /// Actor predicate hit on this URI or origin
    Actor(String),
    /// Boost of this original author
    AnnounceOf(String),
    Text { field: TextField, matched: String },
    /// No predicate configured; the filter applies to every post
    Always,
}

impl std::fmt::Display for MatchCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Actor(who) => write!(f, "actor {who}"),
            Self::AnnounceOf(who) => write!(f, "announce of {who}"),
            Self::Text { field, matched } => write!(f, "text {matched:?} in {field:?}"),
            Self::Always => write!(f, "every post"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterHit {
    pub filter_id: String,
    pub name: String,
    pub cause: MatchCause,
}

/// Union of the actions of every filter that matched a post.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub actions: BTreeSet<FilterAction>,
    pub hits: Vec<FilterHit>,
}

impl Classification {
    pub fn has(&self, action: FilterAction) -> bool {
        self.actions.contains(&action)
    }
}

/// Build the word-anchored, case-insensitive matcher for a user pattern.
fn word_pattern(text: &str) -> Result<Regex, regex::Error> {
    if text.starts_with('#') {
        Regex::new(&format!(r"(?i:{text})\b"))
    } else {
        Regex::new(&format!(r"\b(?i:{text})\b"))
    }
}

/// A filter with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub filter: Filter,
    text: Option<Regex>,
    rewrite: Option<Regex>,
}

impl CompiledFilter {
    /// Invalid patterns disable only the predicate or rewrite they belong to.
    pub fn compile(filter: Filter) -> Self {
        let compile = |what: &str, pattern: &Option<String>| {
            let pattern = pattern.as_deref().filter(|p| !p.is_empty())?;
            match word_pattern(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    tracing::warn!(filter = %filter.id, what, %error, "Ignoring invalid filter pattern");
                    None
                }
            }
        };
        let text = compile("text", &filter.text);
        let rewrite = compile("rewrite", &filter.rewrite);
        Self {
            filter,
            text,
            rewrite,
        }
    }

    pub fn actions(&self) -> BTreeSet<FilterAction> {
        let mut actions = BTreeSet::new();
        let f = &self.filter;
        if f.reject {
            actions.insert(FilterAction::Reject);
        }
        if f.skip_media {
            actions.insert(FilterAction::SkipMedia);
        }
        if f.hide {
            actions.insert(FilterAction::Hide);
        }
        if f.collapse {
            actions.insert(FilterAction::Collapse);
        }
        if self.rewrite.is_some() {
            actions.insert(FilterAction::Rewrite);
        }
        actions
    }

    /// First predicate that matches `post`, checked actor, announce, text.
    ///
    /// A filter without any predicate matches every post.
    pub fn matches(&self, post: &Post) -> Option<MatchCause> {
        if !self.has_predicate() {
            return Some(MatchCause::Always);
        }
        self.match_actor(post)
            .or_else(|| self.match_announce(post))
            .or_else(|| self.match_text(post))
    }

    /// Configured predicates count even when their pattern failed to compile.
    fn has_predicate(&self) -> bool {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        set(&self.filter.actor) || self.filter.is_announce || set(&self.filter.text)
    }

    fn match_actor(&self, post: &Post) -> Option<MatchCause> {
        let wanted = self.filter.actor.as_deref().filter(|a| !a.is_empty())?;
        let hit = |uri: &str| uri == wanted || origin_of(uri) == wanted;

        let mut candidates = vec![post.actor_uri.as_str(), post.object_uri.as_str()];
        if let Some(original) = post.original_actor_uri.as_deref() {
            candidates.push(original);
        }
        if self.filter.include_audience {
            candidates.extend(post.audience.iter().map(String::as_str));
        }

        candidates
            .into_iter()
            .find(|uri| hit(uri))
            .map(|uri| MatchCause::Actor(uri.to_string()))
    }

    fn match_announce(&self, post: &Post) -> Option<MatchCause> {
        if !self.filter.is_announce {
            return None;
        }
        let original = post.original_actor_uri.as_deref().filter(|o| !o.is_empty())?;
        let fires = match self.filter.announce_of.as_deref().filter(|a| !a.is_empty()) {
            None => true,
            Some(wanted) => wanted == original || wanted == origin_of(original),
        };
        fires.then(|| MatchCause::AnnounceOf(original.to_string()))
    }

    fn match_text(&self, post: &Post) -> Option<MatchCause> {
        let regex = self.text.as_ref()?;
        let found = |field: TextField, haystack: &str| {
            regex.find(haystack).map(|m| MatchCause::Text {
                field,
                matched: m.as_str().to_string(),
            })
        };

        found(TextField::Summary, &post.summary_html)
            .or_else(|| found(TextField::Body, &post.body_html))
            .or_else(|| {
                post.attachments
                    .iter()
                    .find_map(|a| found(TextField::AttachmentDescription, &a.description))
            })
    }

    /// Whether this filter takes part in the cheap actor/origin gate.
    fn is_plain_reject(&self) -> bool {
        self.filter.reject
            && !self.filter.is_announce
            && self.filter.text.as_deref().is_none_or(str::is_empty)
    }
}

/// Check one filter against a post without touching any cache.
pub fn matches(post: &Post, filter: &Filter) -> Option<MatchCause> {
    CompiledFilter::compile(filter.clone()).matches(post)
}

/// Compiled, unexpired filters of one user, sorted by name.
#[derive(Debug, Default)]
pub struct UserFilters {
    filters: Vec<CompiledFilter>,
    earliest_expiry: Option<DateTime<Utc>>,
}

impl UserFilters {
    fn build(filters: Vec<Filter>, now: DateTime<Utc>) -> Self {
        let mut compiled: Vec<CompiledFilter> = filters
            .into_iter()
            .filter(|filter| !filter.is_expired_at(now))
            .map(CompiledFilter::compile)
            .collect();
        compiled.sort_by(|a, b| a.filter.name.cmp(&b.filter.name));

        let earliest_expiry = compiled.iter().filter_map(|c| c.filter.expires_at).min();

        Self {
            filters: compiled,
            earliest_expiry,
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// How long these filters stay valid, or `None` when none expire.
    fn time_to_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.earliest_expiry
            .map(|expiry| (expiry - now).to_std().unwrap_or_default() + EXPIRY_SLACK)
    }

    fn with_action(&self, action: FilterAction) -> impl Iterator<Item = &CompiledFilter> {
        self.filters
            .iter()
            .filter(move |compiled| compiled.actions().contains(&action))
    }
}

/// Upper bound on users with filters held in memory.
const CACHE_CAPACITY: u64 = 10_000;

/// Expires a user's entry just after the earliest filter expiry.
struct EarliestExpiry;

impl Expiry<String, Arc<UserFilters>> for EarliestExpiry {
    fn expire_after_create(
        &self,
        _user_id: &String,
        filters: &Arc<UserFilters>,
        _created_at: Instant,
    ) -> Option<Duration> {
        filters.time_to_expiry(Utc::now())
    }
}

/// Filter engine with a per-user compiled cache.
pub struct FilterEngine {
    db: Arc<Database>,
    cache: Cache<String, Arc<UserFilters>>,
    invalidations: AtomicU64,
}

impl FilterEngine {
    pub fn new(db: Arc<Database>) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .expire_after(EarliestExpiry)
            .build();

        Self {
            db,
            cache,
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cached compiled filters for `user_id`, loading them on a miss.
    pub async fn user_filters(&self, user_id: &str) -> Result<Arc<UserFilters>, AppError> {
        if let Some(filters) = self.cache.get(user_id).await {
            crate::metrics::observe_cache("filters", true);
            return Ok(filters);
        }
        crate::metrics::observe_cache("filters", false);

        let started = self.invalidations.load(Ordering::SeqCst);
        let filters = Arc::new(UserFilters::build(
            self.db.list_filters(user_id).await?,
            Utc::now(),
        ));

        // An invalidation landed while loading; serve this result uncached.
        if self.invalidations.load(Ordering::SeqCst) == started {
            self.cache.insert(user_id.to_string(), filters.clone()).await;
        }
        Ok(filters)
    }

    /// Drop the cached filters of `user_id`.
    pub async fn invalidate(&self, user_id: &str) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(user_id).await;
    }

    pub async fn save_filter(&self, filter: &Filter) -> Result<(), AppError> {
        self.db.save_filter(filter).await?;
        self.invalidate(&filter.owner_user_id).await;
        Ok(())
    }

    pub async fn delete_filter(&self, user_id: &str, filter_id: &str) -> Result<bool, AppError> {
        let deleted = self.db.delete_filter(user_id, filter_id).await?;
        self.invalidate(user_id).await;
        Ok(deleted)
    }

    /// Every action that applies to `post` for `user_id`.
    pub async fn classify(&self, post: &Post, user_id: &str) -> Result<Classification, AppError> {
        let filters = self.user_filters(user_id).await?;
        let mut classification = Classification::default();

        for compiled in &filters.filters {
            if let Some(cause) = compiled.matches(post) {
                classification.actions.extend(compiled.actions());
                classification.hits.push(FilterHit {
                    filter_id: compiled.filter.id.clone(),
                    name: compiled.filter.name.clone(),
                    cause,
                });
            }
        }
        Ok(classification)
    }

    /// The first reject filter matching `post`, if any.
    pub async fn rejects(&self, post: &Post, user_id: &str) -> Result<Option<FilterHit>, AppError> {
        let filters = self.user_filters(user_id).await?;
        let hit = filters.with_action(FilterAction::Reject).find_map(|compiled| {
            compiled.matches(post).map(|cause| FilterHit {
                filter_id: compiled.filter.id.clone(),
                name: compiled.filter.name.clone(),
                cause,
            })
        });
        Ok(hit)
    }

    pub async fn skips_media(&self, post: &Post, user_id: &str) -> Result<bool, AppError> {
        let filters = self.user_filters(user_id).await?;
        Ok(filters
            .with_action(FilterAction::SkipMedia)
            .any(|compiled| compiled.matches(post).is_some()))
    }

    /// Whether a plain reject rule names `actor` or its origin.
    pub async fn rejects_actor(&self, user_id: &str, actor: &str) -> Result<bool, AppError> {
        let origin = origin_of(actor);
        let filters = self.user_filters(user_id).await?;
        let rejected = filters
            .filters
            .iter()
            .filter(|compiled| compiled.is_plain_reject())
            .filter_map(|compiled| compiled.filter.actor.as_deref())
            .any(|wanted| wanted == actor || (!origin.is_empty() && wanted == origin));
        if rejected {
            tracing::info!(user = %user_id, %actor, "Rejecting actor");
        }
        Ok(rejected)
    }

    /// Whether a plain reject rule names the origin of `uri`.
    ///
    /// `uri` may also be a bare host.
    pub async fn rejects_origin(&self, user_id: &str, uri: &str) -> Result<bool, AppError> {
        let origin = match origin_of(uri) {
            host if host.is_empty() => uri.to_ascii_lowercase(),
            host => host,
        };
        let filters = self.user_filters(user_id).await?;
        let rejected = filters
            .filters
            .iter()
            .filter(|compiled| compiled.is_plain_reject())
            .any(|compiled| compiled.filter.actor.as_deref() == Some(origin.as_str()));
        if rejected {
            tracing::info!(user = %user_id, %origin, "Rejecting origin");
        }
        Ok(rejected)
    }

    /// Apply hide, collapse and rewrite to a stored post for display.
    ///
    /// Returns `None` when a hide filter matches.
    pub async fn apply_read_time(&self, user_id: &str, mut post: Post) -> Result<Option<Post>, AppError> {
        let filters = self.user_filters(user_id).await?;

        if filters
            .with_action(FilterAction::Hide)
            .any(|compiled| compiled.matches(&post).is_some())
        {
            return Ok(None);
        }

        if let Some(compiled) = filters
            .with_action(FilterAction::Collapse)
            .find(|compiled| compiled.matches(&post).is_some())
        {
            if post.summary_html.is_empty() {
                let f = &compiled.filter;
                post.summary_html = f
                    .actor
                    .clone()
                    .filter(|actor| !actor.is_empty())
                    .or_else(|| f.text.clone())
                    .unwrap_or_else(|| f.name.clone());
            }
        }

        let rewrites: Vec<&CompiledFilter> = filters
            .with_action(FilterAction::Rewrite)
            .filter(|compiled| compiled.matches(&post).is_some())
            .collect();
        for compiled in rewrites {
            if let Some(regex) = &compiled.rewrite {
                let replacement = compiled.filter.replace.as_deref().unwrap_or_default();
                post.body_html = regex.replace_all(&post.body_html, replacement).into_owned();
            }
        }

        Ok(Some(post))
    }
}

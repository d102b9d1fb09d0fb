//! Variant Resolver
//!
//! Pure capability negotiation: given a kind's registry entry, the
//! available representations, and a client capability statement, pick the
//! best representation, determine that a transform must be scheduled, or
//! report that the request is unsatisfiable. Deterministic for fixed
//! inputs and never mutates the available set.

use std::cmp::Ordering;

use crate::capability::{CapabilityStatement, Hints, NetworkClass};
use crate::checksum::ContentHash;
use crate::registry::{RegistryEntry, TransformRule};
use crate::representation::{PayloadSource, Representation};
use crate::transform::{SourceRef, TransformRequest};

/// Outcome of one negotiation. `Unsatisfiable` is a normal, explicit
/// outcome: callers must treat it as a hard delivery failure, never as
/// silently missing content.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Selected(Representation),
    NeedsTransform(TransformRequest),
    Unsatisfiable,
}

/// Tie-break policy for sizing hints. The numeric formula is a deployment
/// policy point, so it sits behind a trait.
pub trait FitPolicy: Send + Sync {
    /// Ordering between two accept-equivalent candidates; `Less` means `a`
    /// is preferred.
    fn compare(&self, a: &Representation, b: &Representation, hints: &Hints) -> Ordering;
}

/// Default policy: prefer the candidate closest to the hinted budget
/// without exceeding it; if every candidate exceeds, closest overall;
/// candidates with unknown size rank last. A constrained network class
/// imposes a payload byte budget on top of the sizing fit, and breaks ties
/// toward the smaller payload.
pub struct ClosestWithoutExceeding;

impl ClosestWithoutExceeding {
    /// (class, distance): class 0 fits the budget, 1 exceeds it, 2 unknown
    fn size_fit(&self, rep: &Representation, hints: &Hints) -> (u8, u64) {
        if let Some(budget) = width_budget(hints) {
            if let Some(w) = rep.effective_width() {
                let w = u64::from(w);
                return if w <= budget { (0, budget - w) } else { (1, w - budget) };
            }
        }
        if let Some(density) = hints.pixel_density {
            if let Some(dpi) = rep.effective_dpi() {
                let (density, dpi) = (u64::from(density), u64::from(dpi));
                return if dpi <= density {
                    (0, density - dpi)
                } else {
                    (1, dpi - density)
                };
            }
        }
        (2, 0)
    }

    fn score(&self, rep: &Representation, hints: &Hints) -> (u8, u64, u64) {
        let (mut class, distance) = self.size_fit(rep, hints);
        let byte_budget = hints.network.and_then(network_byte_budget);
        if byte_budget
            .zip(rep.bytes)
            .map_or(false, |(budget, bytes)| bytes > budget)
        {
            class = class.max(1);
        }
        // Under a bounded network budget, smaller payloads win ties.
        let bytes_rank = match byte_budget {
            Some(_) => rep.bytes.unwrap_or(u64::MAX),
            None => 0,
        };
        (class, distance, bytes_rank)
    }
}

/// Pixel budget: target width scaled by pixel density relative to 96dpi
fn width_budget(hints: &Hints) -> Option<u64> {
    let width = u64::from(hints.target_width?);
    match hints.pixel_density {
        Some(d) => Some(width * u64::from(d.max(96)) / 96),
        None => Some(width),
    }
}

/// Payload ceiling per network class; `Fast` is unbounded
fn network_byte_budget(class: NetworkClass) -> Option<u64> {
    match class {
        NetworkClass::Slow => Some(512 * 1024),
        NetworkClass::Typical => Some(4 * 1024 * 1024),
        NetworkClass::Fast => None,
    }
}

impl FitPolicy for ClosestWithoutExceeding {
    fn compare(&self, a: &Representation, b: &Representation, hints: &Hints) -> Ordering {
        self.score(a, hints).cmp(&self.score(b, hints))
    }
}

/// The resolver. Stateless apart from its fit policy.
pub struct VariantResolver {
    fit: Box<dyn FitPolicy>,
}

impl VariantResolver {
    pub fn new(fit: Box<dyn FitPolicy>) -> Self {
        Self { fit }
    }

    /// Negotiate one delivery request
    pub fn resolve(
        &self,
        entry: &RegistryEntry,
        available: &[Representation],
        capabilities: &CapabilityStatement,
    ) -> Resolution {
        // The registry governs what this kind may serve at all.
        let allowed: Vec<&Representation> = available
            .iter()
            .filter(|r| {
                entry
                    .allowed_representations
                    .iter()
                    .any(|p| p.matches(&r.media_type))
            })
            .collect();

        // 1+2: filter to accept matches, rank, take the best.
        let mut matches: Vec<&Representation> = allowed
            .iter()
            .copied()
            .filter(|r| capabilities.accept_position(&r.media_type).is_some())
            .collect();
        matches.sort_by(|a, b| self.rank(a, b, capabilities));
        if let Some(best) = matches.first() {
            return Resolution::Selected((*best).clone());
        }

        // 3: no match, but a transform rule may produce an accepted type.
        if let Some(request) = self.plan_transform(entry, &allowed, capabilities) {
            return Resolution::NeedsTransform(request);
        }

        // 4: fallback preference list; never triggers a transform.
        for pattern in &entry.fallback_policy {
            let mut candidates: Vec<&Representation> = allowed
                .iter()
                .copied()
                .filter(|r| pattern.matches(&r.media_type))
                .collect();
            candidates.sort_by(|a, b| recency_then_canonical(a, b));
            if let Some(best) = candidates.first() {
                return Resolution::Selected((*best).clone());
            }
        }

        Resolution::Unsatisfiable
    }

    /// Full ranking for accept matches: accept preference, then fit, then
    /// recency, with a canonical-string tie-break so the order is total.
    fn rank(
        &self,
        a: &Representation,
        b: &Representation,
        capabilities: &CapabilityStatement,
    ) -> Ordering {
        let pref = if capabilities.is_weighted() {
            let wa = capabilities.accept_weight(&a.media_type).unwrap_or(0.0);
            let wb = capabilities.accept_weight(&b.media_type).unwrap_or(0.0);
            wb.partial_cmp(&wa).unwrap_or(Ordering::Equal)
        } else {
            let pa = capabilities.accept_position(&a.media_type).unwrap_or(usize::MAX);
            let pb = capabilities.accept_position(&b.media_type).unwrap_or(usize::MAX);
            pa.cmp(&pb)
        };

        pref.then_with(|| self.fit.compare(a, b, &capabilities.hints))
            .then_with(|| recency_then_canonical(a, b))
    }

    /// Find the preferred (rule, source) pair producing an accepted type.
    ///
    /// Accept patterns are walked in preference order; the first rule whose
    /// output satisfies one and whose input matches an available
    /// representation wins.
    fn plan_transform(
        &self,
        entry: &RegistryEntry,
        allowed: &[&Representation],
        capabilities: &CapabilityStatement,
    ) -> Option<TransformRequest> {
        let mut accept_order: Vec<usize> = (0..capabilities.accept.len()).collect();
        if capabilities.is_weighted() {
            accept_order.sort_by(|&i, &j| {
                let wi = capabilities.accept[i].weight.unwrap_or(1.0);
                let wj = capabilities.accept[j].weight.unwrap_or(1.0);
                wj.partial_cmp(&wi).unwrap_or(Ordering::Equal).then(i.cmp(&j))
            });
        }

        for idx in accept_order {
            let accept = &capabilities.accept[idx].pattern;
            for rule in &entry.transform_rules {
                let output = match rule.output.to_concrete() {
                    Some(m) => m,
                    None => continue,
                };
                if !accept.matches(&output) {
                    continue;
                }
                let mut sources: Vec<&Representation> = allowed
                    .iter()
                    .copied()
                    .filter(|r| rule.input.matches(&r.media_type))
                    .collect();
                sources.sort_by(|a, b| recency_then_canonical(a, b));
                if let Some(source) = sources.first() {
                    return Some(build_request(entry, rule, source, output));
                }
            }
        }
        None
    }
}

impl Default for VariantResolver {
    fn default() -> Self {
        Self::new(Box::new(ClosestWithoutExceeding))
    }
}

fn recency_then_canonical(a: &Representation, b: &Representation) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.media_type.canonical().cmp(&b.media_type.canonical()))
}

fn build_request(
    entry: &RegistryEntry,
    rule: &TransformRule,
    source: &Representation,
    output: crate::media::MediaType,
) -> TransformRequest {
    TransformRequest {
        kind_id: entry.kind_id.clone(),
        sources: vec![source_ref(source)],
        operation: rule.operation.clone(),
        options: rule.default_options.clone(),
        output,
        timeout_secs: entry.cache_policy.transform_timeout_secs,
        max_attempts: entry.cache_policy.max_attempts,
    }
}

/// A source reference for the transform job. An authored representation
/// without a recorded hash still gets a deterministic identity derived
/// from its payload.
fn source_ref(rep: &Representation) -> SourceRef {
    let locator = match &rep.payload {
        PayloadSource::External { locator } => locator.clone(),
        PayloadSource::Inline { data } => format!("inline:{}", ContentHash::from_text(data)),
    };
    let content_hash = rep.content_hash.clone().unwrap_or_else(|| match &rep.payload {
        PayloadSource::External { locator } => ContentHash::from_text(locator),
        PayloadSource::Inline { data } => ContentHash::from_text(data),
    });
    SourceRef { locator, content_hash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AcceptPattern;
    use crate::media::{MediaType, MediaTypePattern};
    use crate::registry::{CachePolicy, KindId, RegistryEntry};
    use chrono::{TimeZone, Utc};

    fn entry_with(allowed: &[&str], rules: Vec<TransformRule>, fallback: &[&str]) -> RegistryEntry {
        RegistryEntry {
            kind_id: KindId::parse("core:block").unwrap(),
            schema_ref: "schema:block".to_string(),
            allowed_representations: allowed
                .iter()
                .map(|p| MediaTypePattern::parse(p).unwrap())
                .collect(),
            transform_rules: rules,
            sanitization_policy_ref: None,
            fallback_policy: fallback
                .iter()
                .map(|p| MediaTypePattern::parse(p).unwrap())
                .collect(),
            cache_policy: CachePolicy::default(),
        }
    }

    fn rep(media: &str) -> Representation {
        Representation::new(
            MediaType::parse(media).unwrap(),
            PayloadSource::external(format!("store://{}", media.replace('/', "-"))),
        )
        .with_created_at(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }

    fn md_to_html_rule() -> TransformRule {
        TransformRule {
            input: MediaTypePattern::parse("text/markdown").unwrap(),
            output: MediaTypePattern::parse("text/html").unwrap(),
            operation: "markdown-render".to_string(),
            default_options: serde_json::json!({"sanitize": true}),
        }
    }

    #[test]
    fn test_direct_match_selected() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["image/svg+xml", "image/png"]).unwrap();
        let available = vec![rep("image/png; dpi=96")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => {
                assert_eq!(r.media_type, MediaType::parse("image/png; dpi=96").unwrap())
            }
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_order_wins() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["image/svg+xml", "image/png"]).unwrap();
        let available = vec![rep("image/png"), rep("image/svg+xml")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.essence(), "image/svg+xml"),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_weights_override_position() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::new(vec![
            AcceptPattern::weighted(MediaTypePattern::parse("image/svg+xml").unwrap(), 0.5),
            AcceptPattern::weighted(MediaTypePattern::parse("image/png").unwrap(), 0.9),
        ]);
        let available = vec![rep("image/png"), rep("image/svg+xml")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.essence(), "image/png"),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_width_fit_without_exceeding() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let mut caps = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        caps.hints.target_width = Some(800);
        let available = vec![
            rep("image/png; width=640"),
            rep("image/png; width=1280"),
            rep("image/png; width=320"),
        ];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            // 640 is the largest candidate not exceeding 800
            Resolution::Selected(r) => assert_eq!(r.media_type.numeric_param("width"), Some(640)),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_all_exceed_picks_closest() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let mut caps = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        caps.hints.target_width = Some(200);
        let available = vec![rep("image/png; width=1280"), rep("image/png; width=640")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.numeric_param("width"), Some(640)),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_slow_network_prefers_smaller_payload() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let mut big = rep("image/png; width=4000")
            .with_created_at(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        big.bytes = Some(50 * 1024 * 1024);
        let mut small = rep("image/png; width=400");
        small.bytes = Some(40 * 1024);
        let available = vec![big, small];
        let resolver = VariantResolver::default();

        let mut slow = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        slow.hints.network = Some(NetworkClass::Slow);
        match resolver.resolve(&entry, &available, &slow) {
            Resolution::Selected(r) => assert_eq!(r.media_type.numeric_param("width"), Some(400)),
            other => panic!("expected Selected, got {:?}", other),
        }

        // An unbounded network falls back to recency, so the hint changes
        // the outcome.
        let mut fast = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        fast.hints.network = Some(NetworkClass::Fast);
        match resolver.resolve(&entry, &available, &fast) {
            Resolution::Selected(r) => assert_eq!(r.media_type.numeric_param("width"), Some(4000)),
            other => panic!("expected Selected, got {:?}", other),
        }

        let unhinted = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        match resolver.resolve(&entry, &available, &unhinted) {
            Resolution::Selected(r) => assert_eq!(r.media_type.numeric_param("width"), Some(4000)),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_network_budget_demotes_oversized_fit() {
        // Both candidates fit the width budget; the oversized payload is
        // demoted to the exceeds class under a Typical network.
        let entry = entry_with(&["image/*"], vec![], &[]);
        let mut heavy = rep("image/png; width=640; role=heavy")
            .with_created_at(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        heavy.bytes = Some(16 * 1024 * 1024);
        let mut light = rep("image/png; width=320; role=light");
        light.bytes = Some(200 * 1024);
        let available = vec![heavy, light];

        let mut caps = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        caps.hints.target_width = Some(800);
        caps.hints.network = Some(NetworkClass::Typical);
        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.param("role"), Some("light")),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_recency_breaks_ties() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["image/png"]).unwrap();
        let older = rep("image/png; role=old");
        let newer = rep("image/png; role=new")
            .with_created_at(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        let available = vec![older, newer];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.param("role"), Some("new")),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_transform_planned_when_rule_exists() {
        let entry = entry_with(&["text/*"], vec![md_to_html_rule()], &[]);
        let caps = CapabilityStatement::from_accept(&["text/html"]).unwrap();
        let available = vec![rep("text/markdown")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::NeedsTransform(req) => {
                assert_eq!(req.operation, "markdown-render");
                assert_eq!(req.output, MediaType::parse("text/html").unwrap());
                assert_eq!(req.sources.len(), 1);
                assert_eq!(req.options, serde_json::json!({"sanitize": true}));
            }
            other => panic!("expected NeedsTransform, got {:?}", other),
        }
    }

    #[test]
    fn test_unsatisfiable_without_rule_or_fallback() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["application/pdf"]).unwrap();
        let available = vec![rep("image/png")];

        assert_eq!(
            VariantResolver::default().resolve(&entry, &available, &caps),
            Resolution::Unsatisfiable
        );
    }

    #[test]
    fn test_fallback_selected_when_no_match_or_rule() {
        let entry = entry_with(&["image/*", "text/*"], vec![], &["image/png", "text/plain"]);
        let caps = CapabilityStatement::from_accept(&["application/pdf"]).unwrap();
        let available = vec![rep("text/plain"), rep("image/png")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.essence(), "image/png"),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_never_transforms() {
        // A rule exists but produces nothing the client accepts, and the
        // fallback list has no available representation: hard failure.
        let entry = entry_with(&["text/*"], vec![md_to_html_rule()], &["image/png"]);
        let caps = CapabilityStatement::from_accept(&["application/pdf"]).unwrap();
        let available = vec![rep("text/markdown")];

        assert_eq!(
            VariantResolver::default().resolve(&entry, &available, &caps),
            Resolution::Unsatisfiable
        );
    }

    #[test]
    fn test_disallowed_representation_ignored() {
        let entry = entry_with(&["image/png"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["image/gif", "image/png"]).unwrap();
        let available = vec![rep("image/gif"), rep("image/png")];

        match VariantResolver::default().resolve(&entry, &available, &caps) {
            Resolution::Selected(r) => assert_eq!(r.media_type.essence(), "image/png"),
            other => panic!("expected Selected, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let entry = entry_with(&["image/*"], vec![], &[]);
        let caps = CapabilityStatement::from_accept(&["image/*"]).unwrap();
        let available = vec![rep("image/png"), rep("image/webp"), rep("image/avif")];
        let resolver = VariantResolver::default();

        let first = resolver.resolve(&entry, &available, &caps);
        for _ in 0..5 {
            assert_eq!(resolver.resolve(&entry, &available, &caps), first);
        }
    }
}

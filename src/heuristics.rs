//! Zero-cost pattern tables: sender-domain categories, unambiguous subject/body
//! patterns, facet keyword regexes and the LLM context-window policy.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{sender_address, ClassificationResult, UNCATEGORIZED};

/// A sender-domain category that also needs a confirming keyword in the text
struct DomainCategory {
    name: &'static str,
    label: &'static str,
    /// Substrings matched against the full sender address
    domains: &'static [&'static str],
    confirm: Regex,
}

static DOMAIN_CATEGORIES: Lazy<Vec<DomainCategory>> = Lazy::new(|| {
    vec![
        DomainCategory {
            name: "newsletter",
            label: "Newsletters",
            domains: &[
                "substack.com",
                "medium.com",
                "beehiiv.com",
                "mailchimp",
                "convertkit",
                "newsletter@",
                "news@",
            ],
            confirm: Regex::new(r"(?i)\b(digest|newsletter|weekly|edition|issue #?\d+|roundup|unsubscribe)\b")
                .unwrap(),
        },
        DomainCategory {
            name: "social",
            label: "Social",
            domains: &[
                "facebookmail.com",
                "facebook.com",
                "twitter.com",
                "@x.com",
                "instagram.com",
                "linkedin.com",
                "reddit",
            ],
            confirm: Regex::new(
                r"(?i)\b(notification|connection|invitation|invited you|mentioned you|followed you|commented|liked|reacted|new follower|endorsed)\b",
            )
            .unwrap(),
        },
        DomainCategory {
            name: "automated",
            label: "Automated",
            domains: &[
                "noreply@",
                "no-reply@",
                "donotreply@",
                "do-not-reply@",
                "notifications@",
                "github.com",
                "gitlab.com",
                "atlassian.net",
                "bitbucket.org",
            ],
            confirm: Regex::new(
                r"(?i)(automated|automatic|do not reply|notification|alert|build (failed|passed|succeeded)|pipeline|pull request|merge request|password reset|verification code)",
            )
            .unwrap(),
        },
        DomainCategory {
            name: "ecommerce",
            label: "Shopping",
            domains: &[
                "amazon.",
                "ebay.",
                "shopify",
                "etsy.com",
                "flipkart",
                "aliexpress",
                "walmart.com",
            ],
            confirm: Regex::new(
                r"(?i)\b(order|shipped|shipment|delivery|delivered|tracking|receipt|your cart|refund)\b",
            )
            .unwrap(),
        },
        DomainCategory {
            name: "recruitment",
            label: "Recruitment",
            domains: &[
                "greenhouse.io",
                "lever.co",
                "myworkday",
                "workday.com",
                "naukri",
                "indeed.com",
                "smartrecruiters",
                "ashbyhq",
            ],
            confirm: Regex::new(
                r"(?i)\b(application|applied|interview|candidate|job|position|role|resume|recruiter|offer letter)\b",
            )
            .unwrap(),
        },
    ]
});

/// Independent facet regexes; run for every tier 1-3 result and the floor
struct FacetPatterns {
    hierarchy: Regex,
    client: Regex,
    meeting: Regex,
    escalation: Regex,
    urgent: Regex,
}

static FACETS: Lazy<FacetPatterns> = Lazy::new(|| FacetPatterns {
    hierarchy: Regex::new(
        r"(?i)\b(manager|director|vice president|vp|ceo|cto|cfo|coo|head of|leadership|team lead|skip[- ]level|reporting line|management)\b",
    )
    .unwrap(),

    client: Regex::new(
        r"(?i)\b(client|customer|account manager|proposal|contract|sow|statement of work|deliverables?|kick-?off|purchase order)\b",
    )
    .unwrap(),

    meeting: Regex::new(
        r"(?i)\b(meeting|call|zoom|teams meeting|google meet|calendar|invite|invitation|agenda|standup|stand-up|sync-?up|minutes of|mom)\b",
    )
    .unwrap(),

    escalation: Regex::new(
        r"(?i)(escalat|complaint|unacceptable|\bbreach\b|\bsla\b|critical issue|outage|severity|\bsev[ -]?[12]\b|\bp[01]\b)",
    )
    .unwrap(),

    urgent: Regex::new(
        r"(?i)\b(urgent|urgently|asap|immediately|right away|high priority|time[- ]sensitive|deadline today|by eod|end of day|action required)\b",
    )
    .unwrap(),
});

/// Unambiguous short-circuit patterns for the regex tier
struct ShortCircuitPatterns {
    invoice: Regex,
    payment_terms: Regex,
    meeting: Regex,
    calendar_terms: Regex,
}

static SHORT_CIRCUIT: Lazy<ShortCircuitPatterns> = Lazy::new(|| ShortCircuitPatterns {
    invoice: Regex::new(r"(?i)\b(invoice|receipt)\b").unwrap(),
    payment_terms: Regex::new(
        r"(?i)(amount due|payment due|due date|total due|balance due|paid|payment received|net ?30|net ?60|billing period|remit)",
    )
    .unwrap(),
    meeting: Regex::new(r"(?i)\b(meeting|invite|invitation)\b").unwrap(),
    calendar_terms: Regex::new(
        r"(?i)(calendar|agenda|\.ics\b|when:|join (the )?(zoom|teams|meet)|accept|decline|tentative)",
    )
    .unwrap(),
});

static SIMPLE_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(newsletter|digest|unsubscribe|automated|auto-generated|do not reply|do-not-reply|no-?reply|notifications?@)",
    )
    .unwrap()
});

static MINUTES_OF_MEETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(minutes of (the )?meeting|meeting minutes|\bmom\b|meeting notes|meeting recap|action items|key decisions)",
    )
    .unwrap()
});

static PRIORITY_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(urgent|escalat|priority|critical)").unwrap());

/// A confirmed sender-domain category hit
#[derive(Debug, Clone, PartialEq)]
pub struct DomainMatch {
    pub category: &'static str,
    pub label: &'static str,
    pub matched: &'static str,
}

fn joined(subject: &str, body: &str) -> String {
    format!("{}\n{}", subject, body)
}

/// Five boolean facets computed from keyword regexes
pub fn facets(subject: &str, body: &str) -> ClassificationResult {
    let text = joined(subject, body);
    ClassificationResult {
        is_hierarchy: FACETS.hierarchy.is_match(&text),
        is_client: FACETS.client.is_match(&text),
        is_meeting: FACETS.meeting.is_match(&text),
        is_escalation: FACETS.escalation.is_match(&text),
        is_urgent: FACETS.urgent.is_match(&text),
        suggested_label: UNCATEGORIZED.to_string(),
        reasoning: String::new(),
        confidence: None,
        method: None,
    }
}

/// Sender-domain category, only when the text carries a confirming keyword
pub fn match_domain(sender: &str, subject: &str, body: &str) -> Option<DomainMatch> {
    let address = sender_address(sender);
    if address.is_empty() {
        return None;
    }
    let text = joined(subject, body);

    DOMAIN_CATEGORIES.iter().find_map(|category| {
        let matched = category
            .domains
            .iter()
            .copied()
            .find(|fragment| address.contains(fragment))?;
        if category.confirm.is_match(&text) {
            Some(DomainMatch {
                category: category.name,
                label: category.label,
                matched,
            })
        } else {
            None
        }
    })
}

/// Regex short-circuit: (label, reason) for the unambiguous patterns only
pub fn match_unambiguous(subject: &str, body: &str) -> Option<(&'static str, &'static str)> {
    let text = joined(subject, body);
    if SHORT_CIRCUIT.invoice.is_match(&text) && SHORT_CIRCUIT.payment_terms.is_match(&text) {
        return Some(("Finance", "Invoice or receipt with payment terms"));
    }
    if SHORT_CIRCUIT.meeting.is_match(&text) && SHORT_CIRCUIT.calendar_terms.is_match(&text) {
        return Some(("Meetings", "Meeting with calendar or agenda details"));
    }
    None
}

/// Newsletter, digest and automated mail
pub fn is_simple_email(subject: &str, body: &str, sender: &str) -> bool {
    let head: String = body.chars().take(1000).collect();
    SIMPLE_EMAIL.is_match(subject) || SIMPLE_EMAIL.is_match(sender) || SIMPLE_EMAIL.is_match(&head)
}

/// Body characters sent to the LLM.
///
/// Simple mail gets a fixed small window. Anything else keeps short bodies
/// whole, then grows by half of the remaining length up to `max_chars`.
pub fn context_window(
    body_chars: usize,
    simple: bool,
    simple_chars: usize,
    min_chars: usize,
    max_chars: usize,
) -> usize {
    if simple {
        return simple_chars.min(body_chars);
    }
    if body_chars <= min_chars {
        return body_chars;
    }
    (min_chars + (body_chars - min_chars) / 2).min(max_chars)
}

/// First `chars` characters, never splitting a code point
pub fn truncate_chars(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

/// Reads as the minutes of a meeting
pub fn is_minutes_of_meeting(subject: &str, body: &str) -> bool {
    MINUTES_OF_MEETING.is_match(&joined(subject, body))
}

/// Label semantically denotes urgency, escalation, priority or criticality
pub fn denotes_priority(label: &str) -> bool {
    PRIORITY_LABEL.is_match(label)
}

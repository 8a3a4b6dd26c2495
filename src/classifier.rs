//! Request Classifier
//!
//! Routes a research request to one of the plan shapes the planner knows:
//! - MarketAnalysis: collect data, then analyze it ("分析最近一周的市场行情")
//! - News: summarize current headlines ("今天有什么财经热点")
//! - Risk: assess exposure ("评估这只基金的风险")
//! - General: anything else

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
    MarketAnalysis,
    News,
    Risk,
    General,
}

/// Static keyword lists, checked in priority order
const MARKET_KEYWORDS: &[&str] = &[
    "分析", "趋势", "股票", "市场", "行情",
    "analy", "trend", "stock", "market",
];

const NEWS_KEYWORDS: &[&str] = &[
    "新闻", "资讯", "热点",
    "news", "headline",
];

const RISK_KEYWORDS: &[&str] = &[
    "风险", "评估",
    "risk", "assess",
];

/// Request classifier
pub struct RequestClassifier;

impl RequestClassifier {
    pub fn classify(request: &str) -> RequestCategory {
        let lowered = request.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|kw| lowered.contains(kw));

        if has_any(MARKET_KEYWORDS) {
            RequestCategory::MarketAnalysis
        } else if has_any(NEWS_KEYWORDS) {
            RequestCategory::News
        } else if has_any(RISK_KEYWORDS) {
            RequestCategory::Risk
        } else {
            RequestCategory::General
        }
    }
}

/// Filler phrases removed, in this order, before a request is used as a
/// search query. "帮我" goes before "帮我分析", so the verb survives.
const FILLER_PHRASES: &[&str] = &[
    "请", "帮我", "帮我分析", "帮我查询", "我想知道", "如何", "怎么样", "什么", "哪个", "哪些",
];

/// Reduce a request to its search keywords.
///
/// Falls back to the first 50 characters of the request when nothing is left.
pub fn extract_query(request: &str) -> String {
    let mut query = request.trim().to_string();
    for phrase in FILLER_PHRASES {
        query = query.replace(phrase, "").trim().to_string();
    }

    let cleaned: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() || c == '_' { c } else { ' ' })
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.is_empty() {
        request.chars().take(50).collect()
    } else {
        cleaned
    }
}

//! Outcome and interest classification.
//!
//! The outcome mapping is fixed. Interest classification is injected into
//! the executor as an [`InterestClassifier`] so the policy can be swapped
//! and tested on its own.

use outreach_common::{CallOutcome, InterestStatus};
use serde::{Deserialize, Serialize};

use super::adapter::{CallDisposition, CallReport};

/// Map the adapter's raw disposition onto the three persisted outcomes.
pub fn classify_outcome(report: &CallReport) -> CallOutcome {
    match report.disposition {
        CallDisposition::Answered => CallOutcome::Completed,
        CallDisposition::NoAnswer | CallDisposition::Busy | CallDisposition::Voicemail => {
            CallOutcome::NoAnswer
        }
        CallDisposition::Failed => CallOutcome::Failed,
    }
}

/// Decides how interested a contact was on a completed call.
/// Only consulted for `CallOutcome::Completed`; must answer HOT, WARM or COLD.
pub trait InterestClassifier: Send + Sync {
    fn classify(&self, report: &CallReport) -> InterestStatus;
}

/// Keyword scoring over the transcript and summary.
///
/// Any hot keyword makes the lead HOT; otherwise any warm keyword makes it
/// WARM; everything else is COLD. Matching is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct KeywordClassifier {
    pub hot_keywords: Vec<String>,
    pub warm_keywords: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            hot_keywords: ["sign up", "buy", "book a demo", "send the contract", "ready to start"]
                .map(String::from)
                .to_vec(),
            warm_keywords: ["pricing", "call me back", "send more info", "interested", "maybe"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl KeywordClassifier {
    fn mentions(text: &str, keywords: &[String]) -> bool {
        keywords
            .iter()
            .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
    }
}

impl InterestClassifier for KeywordClassifier {
    fn classify(&self, report: &CallReport) -> InterestStatus {
        let text = [report.transcript.as_deref(), report.summary.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        if Self::mentions(&text, &self.hot_keywords) {
            InterestStatus::Hot
        } else if Self::mentions(&text, &self.warm_keywords) {
            InterestStatus::Warm
        } else {
            InterestStatus::Cold
        }
    }
}

/// Always answers the same status. Useful for dry runs and tests.
pub struct FixedClassifier(pub InterestStatus);

impl InterestClassifier for FixedClassifier {
    fn classify(&self, _report: &CallReport) -> InterestStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let cases = [
            (CallDisposition::Answered, CallOutcome::Completed),
            (CallDisposition::NoAnswer, CallOutcome::NoAnswer),
            (CallDisposition::Busy, CallOutcome::NoAnswer),
            (CallDisposition::Voicemail, CallOutcome::NoAnswer),
            (CallDisposition::Failed, CallOutcome::Failed),
        ];
        for (disposition, expected) in cases {
            let report = CallReport::with_disposition(disposition);
            assert_eq!(classify_outcome(&report), expected, "{:?}", disposition);
        }
    }

    #[test]
    fn test_keyword_classifier_tiers() {
        let c = KeywordClassifier::default();
        assert_eq!(
            c.classify(&CallReport::answered("We are READY TO START next week")),
            InterestStatus::Hot
        );
        assert_eq!(
            c.classify(&CallReport::answered("Can you send more info on pricing?")),
            InterestStatus::Warm
        );
        assert_eq!(
            c.classify(&CallReport::answered("Not for us, thanks")),
            InterestStatus::Cold
        );
    }

    #[test]
    fn test_keyword_classifier_reads_summary_too() {
        let c = KeywordClassifier::default();
        let mut report = CallReport::with_disposition(CallDisposition::Answered);
        report.summary = Some("Prospect asked us to call me back tomorrow".into());
        assert_eq!(c.classify(&report), InterestStatus::Warm);
    }

    #[test]
    fn test_empty_keywords_never_match() {
        let c = KeywordClassifier {
            hot_keywords: vec![String::new()],
            warm_keywords: vec![],
        };
        assert_eq!(c.classify(&CallReport::answered("anything")), InterestStatus::Cold);
    }
}

//! Label-matching utility: the mandatory/optional label predicate
//! used by both pub/sub and RPC discovery matching, plus the media-type
//! wildcard rule.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelKind {
  Mandatory,
  Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchingLabel {
  pub key: String,
  pub value: String,
  pub kind: LabelKind,
}

impl MatchingLabel {
  pub fn new(key: impl Into<String>, value: impl Into<String>, kind: LabelKind) -> Self {
    MatchingLabel { key: key.into(), value: value.into(), kind }
  }
}

/// `MatchLabels(subLabels, pubLabels)`: every mandatory subscriber label must
/// appear with a matching value among the publisher's labels; every optional
/// subscriber label that *does* appear in the publisher's labels must match
/// too (absent is fine). Publisher-only labels never cause a mismatch. A
/// value of `""` on either side means "match any value for this key".
pub fn match_labels(subscriber: &[MatchingLabel], publisher: &[MatchingLabel]) -> bool {
  subscriber.iter().all(|sub_label| {
    let found = publisher.iter().find(|p| p.key == sub_label.key);
    match (sub_label.kind, found) {
      (LabelKind::Mandatory, None) => false,
      (LabelKind::Mandatory, Some(p)) => values_match(&sub_label.value, &p.value),
      (LabelKind::Optional, None) => true,
      (LabelKind::Optional, Some(p)) => values_match(&sub_label.value, &p.value),
    }
  })
}

fn values_match(sub_value: &str, pub_value: &str) -> bool {
  sub_value.is_empty() || sub_value == pub_value
}

/// Media-type wildcard rule: an empty subscriber media type matches any
/// publisher media type; a non-empty one must match exactly. The publisher's
/// media type is always taken literally.
pub fn match_media_type(subscriber_media_type: &str, publisher_media_type: &str) -> bool {
  subscriber_media_type.is_empty() || subscriber_media_type == publisher_media_type
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  fn label(key: &str, value: &str, kind: LabelKind) -> MatchingLabel {
    MatchingLabel::new(key, value, kind)
  }

  #[test]
  fn mandatory_label_must_be_present_and_equal() {
    let sub = vec![label("k1", "v1", LabelKind::Mandatory)];
    assert!(match_labels(&sub, &[label("k1", "v1", LabelKind::Mandatory)]));
    assert!(!match_labels(&sub, &[label("k1", "other", LabelKind::Mandatory)]));
    assert!(!match_labels(&sub, &[]));
  }

  #[test]
  fn optional_label_absent_is_fine_present_must_match() {
    let sub = vec![label("k2", "v2", LabelKind::Optional)];
    assert!(match_labels(&sub, &[]));
    assert!(match_labels(&sub, &[label("k2", "v2", LabelKind::Mandatory)]));
    assert!(!match_labels(&sub, &[label("k2", "other", LabelKind::Mandatory)]));
  }

  #[test]
  fn publisher_only_labels_do_not_cause_mismatch() {
    let sub = vec![label("k1", "v1", LabelKind::Mandatory)];
    let publisher = vec![
      label("k1", "v1", LabelKind::Mandatory),
      label("extra", "whatever", LabelKind::Mandatory),
    ];
    assert!(match_labels(&sub, &publisher));
  }

  #[test]
  fn combined_mandatory_and_optional_labels_match_independently() {
    // A subscriber with labels [(k1,v1,Mandatory),(k2,v2,Optional)] matches
    // publisher labels L iff (k1,v1) in L and (k2 not in keys(L) or (k2,v2) in L).
    let sub = vec![
      label("k1", "v1", LabelKind::Mandatory),
      label("k2", "v2", LabelKind::Optional),
    ];
    assert!(match_labels(&sub, &[label("k1", "v1", LabelKind::Mandatory)]));
    assert!(match_labels(
      &sub,
      &[label("k1", "v1", LabelKind::Mandatory), label("k2", "v2", LabelKind::Mandatory)]
    ));
    assert!(!match_labels(
      &sub,
      &[label("k1", "v1", LabelKind::Mandatory), label("k2", "wrong", LabelKind::Mandatory)]
    ));
    assert!(!match_labels(&sub, &[label("k2", "v2", LabelKind::Mandatory)]));
  }

  #[test]
  fn empty_value_matches_any_value_for_key() {
    let sub = vec![label("k1", "", LabelKind::Mandatory)];
    assert!(match_labels(&sub, &[label("k1", "anything", LabelKind::Mandatory)]));
  }

  #[test_case("", "A" => true; "empty subscriber matches any publisher")]
  #[test_case("", "" => true; "empty matches empty")]
  #[test_case("A", "A" => true; "exact match")]
  #[test_case("A", "B" => false; "mismatch is rejected")]
  #[test_case("A", "" => false; "non-empty subscriber requires exact match")]
  fn media_type_wildcard_rule(subscriber: &str, publisher: &str) -> bool {
    match_media_type(subscriber, publisher)
  }
}

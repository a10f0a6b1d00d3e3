// Window condition matching
//
// Shadow excludes, focus rules, opacity rules and the various
// paint exclusions are all expressed as conditions over a window's
// name/class/role strings, its EWMH type and a couple of state
// bits. Patterns are regexes.
//
// Austin Shafer - 2024
extern crate regex;
use regex::Regex;

use crate::server::WinType;
use crate::window::WinRecord;
use utils::Result;

/// One window condition
///
/// All populated fields must match for the rule to match. A rule
/// with no fields set matches every window.
#[derive(Debug, Clone)]
pub struct WinRule {
    wr_name: Option<Regex>,
    /// matched against both the instance and general class strings
    wr_class: Option<Regex>,
    wr_role: Option<Regex>,
    wr_type: Option<WinType>,
    wr_fullscreen: Option<bool>,
    wr_focused: Option<bool>,
}

impl WinRule {
    pub fn new() -> WinRule {
        WinRule {
            wr_name: None,
            wr_class: None,
            wr_role: None,
            wr_type: None,
            wr_fullscreen: None,
            wr_focused: None,
        }
    }

    pub fn name(mut self, pattern: &str) -> Result<WinRule> {
        self.wr_name = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn class(mut self, pattern: &str) -> Result<WinRule> {
        self.wr_class = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn role(mut self, pattern: &str) -> Result<WinRule> {
        self.wr_role = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn wintype(mut self, ty: WinType) -> WinRule {
        self.wr_type = Some(ty);
        self
    }

    pub fn fullscreen(mut self, fullscreen: bool) -> WinRule {
        self.wr_fullscreen = Some(fullscreen);
        self
    }

    pub fn focused(mut self, focused: bool) -> WinRule {
        self.wr_focused = Some(focused);
        self
    }

    pub fn matches(&self, rec: &WinRecord) -> bool {
        if let Some(re) = self.wr_name.as_ref() {
            if !re.is_match(&rec.w_name) {
                return false;
            }
        }
        if let Some(re) = self.wr_class.as_ref() {
            if !re.is_match(&rec.w_class_instance) && !re.is_match(&rec.w_class_general) {
                return false;
            }
        }
        if let Some(re) = self.wr_role.as_ref() {
            if !re.is_match(&rec.w_role) {
                return false;
            }
        }
        if let Some(ty) = self.wr_type {
            if rec.w_type != ty {
                return false;
            }
        }
        if let Some(fs) = self.wr_fullscreen {
            if rec.w_is_fullscreen != fs {
                return false;
            }
        }
        if let Some(focused) = self.wr_focused {
            if rec.w_focused != focused {
                return false;
            }
        }
        return true;
    }
}

/// Does any rule in the list match
pub fn rules_match(rules: &[WinRule], rec: &WinRecord) -> bool {
    rules.iter().any(|r| r.matches(rec))
}

/// First matching opacity rule, if any
pub fn opacity_rule_match(rules: &[(f64, WinRule)], rec: &WinRecord) -> Option<f64> {
    rules
        .iter()
        .find(|(_, rule)| rule.matches(rec))
        .map(|(op, _)| *op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Xid;
    use crate::window::{WinId, WinRecord};

    fn test_rec() -> WinRecord {
        let mut rec = WinRecord::placeholder(WinId::invalid(), Xid(1), 0);
        rec.w_name = "Picture in Picture".to_string();
        rec.w_class_instance = "navigator".to_string();
        rec.w_class_general = "Firefox".to_string();
        rec.w_role = "browser".to_string();
        rec.w_type = WinType::Utility;
        rec.w_focused = true;
        return rec;
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rec = test_rec();
        assert!(WinRule::new().matches(&rec));
    }

    #[test]
    fn all_conditions_must_hold() {
        let rec = test_rec();

        let rule = WinRule::new()
            .class("^Firefox$")
            .unwrap()
            .wintype(WinType::Utility)
            .focused(true);
        assert!(rule.matches(&rec));

        // one mismatching condition sinks the rule
        let rule = WinRule::new()
            .class("^Firefox$")
            .unwrap()
            .wintype(WinType::Dialog);
        assert!(!rule.matches(&rec));
    }

    #[test]
    fn class_matches_either_string() {
        let rec = test_rec();
        assert!(WinRule::new().class("^navigator$").unwrap().matches(&rec));
        assert!(WinRule::new().class("^Firefox$").unwrap().matches(&rec));
        assert!(!WinRule::new().class("^Chromium$").unwrap().matches(&rec));
    }

    #[test]
    fn rule_lists() {
        let rec = test_rec();
        let rules = vec![
            WinRule::new().name("^Steam$").unwrap(),
            WinRule::new().name("Picture in Picture").unwrap(),
        ];
        assert!(rules_match(&rules, &rec));

        let opacities = vec![
            (0.5, WinRule::new().role("^terminal$").unwrap()),
            (0.9, WinRule::new().role("^browser$").unwrap()),
        ];
        assert_eq!(opacity_rule_match(&opacities, &rec), Some(0.9));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(WinRule::new().name("[unclosed").is_err());
    }
}

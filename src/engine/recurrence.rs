use std::collections::HashSet;

use chrono::Days;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_expansion_window;
use super::{CommitGate, Engine, EngineError};

/// Check a weekly rule set before it replaces the provider's current one.
pub fn validate_rules(provider_id: ActorId, rules: &[WeeklyScheduleRule]) -> Result<(), EngineError> {
    if rules.len() > MAX_RULES_PER_SCHEDULE {
        return Err(EngineError::InvalidRule(format!(
            "{} rules given, at most one per weekday",
            rules.len()
        )));
    }
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.provider_id != provider_id {
            return Err(EngineError::InvalidRule(format!(
                "rule for day {} belongs to another provider",
                rule.day_of_week
            )));
        }
        if rule.day_of_week > 6 {
            return Err(EngineError::InvalidRule(format!(
                "day_of_week {} is outside 0..=6",
                rule.day_of_week
            )));
        }
        if !seen.insert(rule.day_of_week) {
            return Err(EngineError::InvalidRule(format!(
                "day_of_week {} appears twice",
                rule.day_of_week
            )));
        }
        if rule.enabled && rule.start >= rule.end {
            return Err(EngineError::InvalidRule(format!(
                "day {}: start {} is not before end {}",
                rule.day_of_week,
                rule.start.format("%H:%M"),
                rule.end.format("%H:%M")
            )));
        }
    }
    Ok(())
}

/// Turn weekly rules into dated slots over `window`. Dates whose weekday has
/// no enabled rule produce nothing; a candidate overlapping any of the
/// provider's `existing` slots on that date is skipped, so repeated expansion
/// over the same window adds nothing.
pub fn expand(
    provider_id: ActorId,
    rules: &[WeeklyScheduleRule],
    window: &DateWindow,
    existing: &[AvailabilitySlot],
    created_at: Ms,
) -> Vec<AvailabilitySlot> {
    let mut out = Vec::new();
    for date in window.days() {
        let dow = day_of_week(date);
        let Some(rule) = rules.iter().find(|r| r.day_of_week == dow && r.enabled) else {
            continue;
        };
        let Ok(range) = TimeRange::new(date, rule.start, rule.end) else {
            continue;
        };
        let on_date = existing
            .iter()
            .filter(|s| s.provider_id == provider_id && s.range.date() == date);
        let mut skip = false;
        for slot in on_date {
            if slot.range == range && slot.hourly_rate == rule.hourly_rate {
                skip = true;
                break;
            }
            if slot.range.overlaps(&range) {
                debug!(%provider_id, %date, existing = %slot.id, "expansion skipped overlapping slot");
                skip = true;
                break;
            }
        }
        if skip {
            continue;
        }
        out.push(AvailabilitySlot {
            id: Ulid::new(),
            provider_id,
            range,
            hourly_rate: rule.hourly_rate,
            created_at,
        });
    }
    out
}

impl Engine {
    /// Replace the provider's weekly rule set and expand it over the default
    /// window starting today. Returns the number of slots created.
    pub async fn publish_weekly_schedule(
        &self,
        actor: Actor,
        rules: Vec<WeeklyScheduleRule>,
    ) -> Result<usize, EngineError> {
        if actor.role != Role::Provider {
            return Err(EngineError::Unauthorized("only providers publish availability"));
        }
        validate_rules(actor.id, &rules)?;

        let today = self.clock.today();
        let window = DateWindow::new(
            today,
            today
                .checked_add_days(Days::new(self.config.expansion_days.max(0) as u64))
                .unwrap_or(today),
        );
        validate_expansion_window(&window)?;

        let gate = self.enter_commit(actor.id).await?;
        let _provider = self.lock_provider(actor.id).await?;

        let event = Event::ScheduleReplaced {
            provider_id: actor.id,
            rules: rules.clone(),
        };
        self.persist_and_apply(&gate, &mut [], &event).await?;

        let created = self.expand_locked(&gate, actor.id, &rules, &window).await?;
        info!(provider_id = %actor.id, rules = rules.len(), created, "weekly schedule published");
        Ok(created)
    }

    /// Expand the provider's current rules over an explicit window.
    pub async fn expand_schedule(&self, actor: Actor, window: DateWindow) -> Result<usize, EngineError> {
        if actor.role != Role::Provider {
            return Err(EngineError::Unauthorized("only providers publish availability"));
        }
        validate_expansion_window(&window)?;

        let gate = self.enter_commit(actor.id).await?;
        let _provider = self.lock_provider(actor.id).await?;

        let rules = self.schedule(&actor.id);
        let created = self.expand_locked(&gate, actor.id, &rules, &window).await?;
        info!(provider_id = %actor.id, created, "schedule expanded");
        Ok(created)
    }

    /// Caller holds the provider lane.
    async fn expand_locked(
        &self,
        gate: &CommitGate,
        provider_id: ActorId,
        rules: &[WeeklyScheduleRule],
        window: &DateWindow,
    ) -> Result<usize, EngineError> {
        let existing = self.slots.list_by_provider(&provider_id, Some(window));
        let candidates = expand(provider_id, rules, window, &existing, self.clock.now());
        let mut created = 0;
        for slot in candidates {
            if self.slots.provider_slot_count(&provider_id) >= MAX_SLOTS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many slots for provider"));
            }
            self.persist_and_apply(gate, &mut [], &Event::SlotCreated { slot })
                .await?;
            created += 1;
        }
        metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL, "source" => "schedule")
            .increment(created as u64);
        Ok(created)
    }

    /// The provider's current weekly rules, ordered by weekday.
    pub fn schedule(&self, provider_id: &ActorId) -> Vec<WeeklyScheduleRule> {
        let mut rules = self
            .schedules
            .get(provider_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        rules.sort_by_key(|r| r.day_of_week);
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn rule(provider_id: ActorId, dow: u8, enabled: bool, start: &str, end: &str) -> WeeklyScheduleRule {
        WeeklyScheduleRule {
            provider_id,
            day_of_week: dow,
            enabled,
            start: t(start),
            end: t(end),
            hourly_rate: Money::from_cents(5000),
        }
    }

    #[test]
    fn expands_enabled_weekdays_only() {
        let p = Ulid::new();
        let rules = vec![
            rule(p, 1, true, "09:00", "12:00"),
            rule(p, 2, false, "09:00", "12:00"),
        ];
        // 2026-11-01 is a Sunday.
        let window = DateWindow::new(d("2026-11-01"), d("2026-11-15"));
        let slots = expand(p, &rules, &window, &[], 0);

        let dates: Vec<_> = slots.iter().map(|s| s.range.date()).collect();
        assert_eq!(dates, vec![d("2026-11-02"), d("2026-11-09")]);
        assert!(slots.iter().all(|s| s.range.start() == t("09:00") && s.provider_id == p));
    }

    #[test]
    fn monday_rule_over_two_weeks() {
        let p = Ulid::new();
        let rules = vec![rule(p, 1, true, "09:00", "17:00")];
        let window = DateWindow::new(d("2025-01-06"), d("2025-01-20"));
        let slots = expand(p, &rules, &window, &[], 0);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].range.date(), d("2025-01-06"));
        assert_eq!(slots[1].range.date(), d("2025-01-13"));
    }

    #[test]
    fn expansion_is_idempotent() {
        let p = Ulid::new();
        let rules = vec![rule(p, 1, true, "09:00", "12:00"), rule(p, 3, true, "13:00", "15:00")];
        let window = DateWindow::new(d("2026-11-01"), d("2026-11-29"));
        let first = expand(p, &rules, &window, &[], 0);
        assert_eq!(first.len(), 8);
        let second = expand(p, &rules, &window, &first, 0);
        assert!(second.is_empty());
    }

    #[test]
    fn overlapping_existing_slot_is_left_alone() {
        let p = Ulid::new();
        let existing = AvailabilitySlot {
            id: Ulid::new(),
            provider_id: p,
            range: TimeRange::new(d("2026-11-02"), t("11:00"), t("13:00")).unwrap(),
            hourly_rate: Money::from_cents(9900),
            created_at: 0,
        };
        let rules = vec![rule(p, 1, true, "09:00", "12:00")];
        let window = DateWindow::new(d("2026-11-02"), d("2026-11-10"));
        let slots = expand(p, &rules, &window, std::slice::from_ref(&existing), 0);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].range.date(), d("2026-11-09"));
    }

    #[test]
    fn other_providers_slots_do_not_block() {
        let p = Ulid::new();
        let foreign = AvailabilitySlot {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            range: TimeRange::new(d("2026-11-02"), t("09:00"), t("12:00")).unwrap(),
            hourly_rate: Money::from_cents(5000),
            created_at: 0,
        };
        let rules = vec![rule(p, 1, true, "09:00", "12:00")];
        let window = DateWindow::single(d("2026-11-02"));
        assert_eq!(expand(p, &rules, &window, &[foreign], 0).len(), 1);
    }

    #[test]
    fn validate_rejects_bad_rules() {
        let p = Ulid::new();
        assert!(validate_rules(p, &[rule(p, 1, true, "09:00", "17:00")]).is_ok());
        // Disabled days may carry any times.
        assert!(validate_rules(p, &[rule(p, 1, false, "17:00", "09:00")]).is_ok());

        let cases = [
            vec![rule(p, 1, true, "17:00", "09:00")],
            vec![rule(p, 1, true, "09:00", "09:00")],
            vec![rule(p, 7, true, "09:00", "10:00")],
            vec![rule(p, 2, true, "09:00", "10:00"), rule(p, 2, false, "09:00", "10:00")],
            vec![rule(Ulid::new(), 1, true, "09:00", "10:00")],
        ];
        for rules in cases {
            assert!(
                matches!(validate_rules(p, &rules), Err(EngineError::InvalidRule(_))),
                "{rules:?}"
            );
        }
    }
}

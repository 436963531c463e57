use std::sync::{Arc, Mutex, MutexGuard};

use caldaia_core::config::BoilerConfig;
use caldaia_core::{BoilerInfo, ProtectionSample, Rule, State, SwitchSample};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::listen::FieldListener;
use crate::series;

/// Aggregate updates buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Handle to one boiler aggregate and its time series.
///
/// Clones share the connection and the change channel. Every mutation is a
/// read-modify-conditional-write performed under the connection mutex: the
/// new aggregate is only persisted and published when its serialised form
/// differs from the stored one.
#[derive(Clone)]
pub struct Boiler {
    config: BoilerConfig,
    db: Arc<Mutex<Connection>>,
    tx: broadcast::Sender<BoilerInfo>,
}

impl Boiler {
    /// Initialise the schema on `conn` and wrap it.
    pub fn open(conn: Connection, config: BoilerConfig) -> Result<Self> {
        init_db(&conn)?;
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            config,
            db: Arc::new(Mutex::new(conn)),
            tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current aggregate; the default one is created on first access.
    pub fn info(&self) -> Result<BoilerInfo> {
        let db = self.lock()?;
        Ok(self.load(&db)?.0)
    }

    pub fn rules(&self) -> Result<Vec<Rule>> {
        Ok(self.info()?.rules)
    }

    /// Request the relay state. Only `ON` and `OFF` are accepted.
    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn switch(&self, state: State) -> Result<State> {
        if state == State::Unknown {
            return Err(StoreError::InvalidState(state));
        }
        let info = self.update(|info| {
            info.state = state;
            Ok(())
        })?;
        Ok(info.state)
    }

    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn set_overheating_protection(&self, active: bool) -> Result<BoilerInfo> {
        self.update(|info| {
            info.is_overheating_protection_active = active;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn set_min_temp(&self, temp: f64) -> Result<BoilerInfo> {
        self.update(|info| {
            if !temp.is_finite() || temp > info.max_temp {
                return Err(StoreError::InvalidBounds {
                    min: temp,
                    max: info.max_temp,
                });
            }
            info.min_temp = temp;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn set_max_temp(&self, temp: f64) -> Result<BoilerInfo> {
        self.update(|info| {
            if !temp.is_finite() || temp < info.min_temp {
                return Err(StoreError::InvalidBounds {
                    min: info.min_temp,
                    max: temp,
                });
            }
            info.max_temp = temp;
            Ok(())
        })
    }

    /// Insert or replace a rule, generating its id when empty.
    ///
    /// The target temperature is checked against the bounds in force now and
    /// never re-validated later.
    #[instrument(skip(self, rule), fields(boiler = %self.config.name, rule_id = %rule.id))]
    pub fn set_rule(&self, mut rule: Rule) -> Result<Rule> {
        rule.validate()?;
        if rule.id.is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        let stored = rule.clone();
        self.update(move |info| {
            if rule.target_temp < info.min_temp || rule.target_temp > info.max_temp {
                return Err(StoreError::TemperatureOutOfBounds {
                    temp: rule.target_temp,
                    min: info.min_temp,
                    max: info.max_temp,
                });
            }
            let mut rules = info.rule_map();
            rules.insert(rule.id.clone(), rule);
            info.set_rules(rules);
            Ok(())
        })?;
        info!(rule_id = %stored.id, "rule set");
        Ok(stored)
    }

    /// Mark a rule as started, forgetting any earlier stop.
    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn start_rule(&self, id: &str) -> Result<()> {
        self.modify_rule(id, |rule| {
            rule.is_active = true;
            rule.stopped_time = None;
        })?;
        info!(rule_id = %id, "rule started");
        Ok(())
    }

    /// Record an explicit stop at the current instant.
    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn stop_rule(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        self.modify_rule(id, |rule| {
            rule.is_active = false;
            rule.stopped_time = Some(now);
        })?;
        info!(rule_id = %id, "rule stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(boiler = %self.config.name))]
    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.update(|info| {
            let mut rules = info.rule_map();
            if rules.remove(id).is_none() {
                return Err(StoreError::RuleNotFound { id: id.to_string() });
            }
            info.set_rules(rules);
            Ok(())
        })?;
        info!(rule_id = %id, "rule deleted");
        Ok(())
    }

    /// Raw stream of every saved aggregate.
    pub fn subscribe(&self) -> broadcast::Receiver<BoilerInfo> {
        self.tx.subscribe()
    }

    /// Yields the rule list whenever it changes.
    pub fn listen_rules(&self) -> Result<FieldListener<Vec<Rule>>> {
        FieldListener::new(self.clone(), |info| info.rules.clone())
    }

    /// Yields the protection flag whenever it flips.
    pub fn listen_protection(&self) -> Result<FieldListener<bool>> {
        FieldListener::new(self.clone(), |info| info.is_overheating_protection_active)
    }

    pub fn append_switch_sample(&self, sample: SwitchSample) -> Result<()> {
        let db = self.lock()?;
        series::append(&db, &self.switch_series(), sample.time, sample.state.as_sample_value())
    }

    pub fn switch_history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SwitchSample>> {
        let db = self.lock()?;
        let rows = series::range(&db, &self.switch_series(), from, to)?;
        Ok(rows.into_iter().map(switch_sample).collect())
    }

    pub fn last_switch_sample_at(&self, at: DateTime<Utc>) -> Result<Option<SwitchSample>> {
        let db = self.lock()?;
        let row = series::last_at_or_before(&db, &self.switch_series(), at)?;
        Ok(row.map(switch_sample))
    }

    pub fn append_protection_sample(&self, sample: ProtectionSample) -> Result<()> {
        let db = self.lock()?;
        series::append(
            &db,
            &self.protection_series(),
            sample.time,
            protection_value(sample.is_active),
        )
    }

    pub fn protection_history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProtectionSample>> {
        let db = self.lock()?;
        let rows = series::range(&db, &self.protection_series(), from, to)?;
        Ok(rows.into_iter().map(protection_sample).collect())
    }

    pub fn last_protection_sample_at(&self, at: DateTime<Utc>) -> Result<Option<ProtectionSample>> {
        let db = self.lock()?;
        let row = series::last_at_or_before(&db, &self.protection_series(), at)?;
        Ok(row.map(protection_sample))
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn switch_series(&self) -> String {
        format!("switch:{}", self.config.name)
    }

    fn protection_series(&self) -> String {
        format!("overheating:{}", self.config.name)
    }

    /// Read the stored aggregate, creating the default one if absent.
    fn load(&self, db: &Connection) -> Result<(BoilerInfo, String)> {
        let stored: Option<String> = db
            .query_row(
                "SELECT data FROM aggregates WHERE name = ?1",
                params![self.config.name],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(data) = stored {
            let info: BoilerInfo = serde_json::from_str(&data)?;
            let canonical = info.to_json()?;
            return Ok((info, canonical));
        }

        let info = BoilerInfo::with_bounds(
            self.config.default_min_temp,
            self.config.default_max_temp,
        );
        let data = info.to_json()?;
        db.execute(
            "INSERT INTO aggregates (name, data, updated_at) VALUES (?1, ?2, ?3)",
            params![self.config.name, data, Utc::now().to_rfc3339()],
        )?;
        debug!(boiler = %self.config.name, "default aggregate created");
        Ok((info, data))
    }

    /// Read-modify-conditional-write under the connection lock.
    ///
    /// A rejected modification leaves the stored aggregate untouched.
    fn update<F>(&self, modify: F) -> Result<BoilerInfo>
    where
        F: FnOnce(&mut BoilerInfo) -> Result<()>,
    {
        let mut db = self.lock()?;
        let (current, current_json) = self.load(&db)?;
        let mut next = current.clone();
        modify(&mut next)?;

        let next_json = next.to_json()?;
        if next_json == current_json {
            debug!(boiler = %self.config.name, "aggregate unchanged, save skipped");
            return Ok(next);
        }

        let now = Utc::now();
        let txn = db.transaction()?;
        txn.execute(
            "UPDATE aggregates SET data = ?1, updated_at = ?2 WHERE name = ?3",
            params![next_json, now.to_rfc3339(), self.config.name],
        )?;
        if next.state != current.state {
            series::append(&txn, &self.switch_series(), now, next.state.as_sample_value())?;
            info!(boiler = %self.config.name, from = %current.state, to = %next.state, "boiler switched");
        }
        if next.is_overheating_protection_active != current.is_overheating_protection_active {
            series::append(
                &txn,
                &self.protection_series(),
                now,
                protection_value(next.is_overheating_protection_active),
            )?;
            info!(
                boiler = %self.config.name,
                active = next.is_overheating_protection_active,
                "overheating protection changed"
            );
        }
        txn.commit()?;

        // Published while still holding the lock so subscribers observe saves in order.
        let _ = self.tx.send(next.clone());
        Ok(next)
    }

    fn modify_rule<F>(&self, id: &str, change: F) -> Result<BoilerInfo>
    where
        F: FnOnce(&mut Rule),
    {
        self.update(|info| {
            let mut rules = info.rule_map();
            let rule = rules
                .get_mut(id)
                .ok_or_else(|| StoreError::RuleNotFound { id: id.to_string() })?;
            change(rule);
            info.set_rules(rules);
            Ok(())
        })
    }
}

fn protection_value(active: bool) -> f64 {
    if active {
        1.0
    } else {
        0.0
    }
}

fn switch_sample((time, value): (DateTime<Utc>, f64)) -> SwitchSample {
    SwitchSample {
        time,
        state: State::from_sample_value(value),
    }
}

fn protection_sample((time, value): (DateTime<Utc>, f64)) -> ProtectionSample {
    ProtectionSample {
        time,
        is_active: value != 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn boiler() -> Boiler {
        let conn = Connection::open_in_memory().unwrap();
        Boiler::open(conn, BoilerConfig::default()).unwrap()
    }

    fn rule(target_temp: f64) -> Rule {
        Rule {
            id: String::new(),
            start: Utc::now() + Duration::hours(1),
            duration: Duration::hours(1),
            delay: Duration::zero(),
            target_temp,
            repeat_days: Default::default(),
            is_active: false,
            stopped_time: None,
        }
    }

    fn all_time() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc::now() - Duration::days(1), Utc::now() + Duration::days(1))
    }

    #[test]
    fn first_access_creates_default() {
        let boiler = boiler();
        let mut rx = boiler.subscribe();
        let info = boiler.info().unwrap();
        assert_eq!(info.state, State::Unknown);
        assert_eq!(info.min_temp, 10.0);
        assert_eq!(info.max_temp, 25.0);
        assert!(!info.is_overheating_protection_active);
        assert!(info.rules.is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn switch_records_sample_and_publishes() {
        let boiler = boiler();
        let mut rx = boiler.subscribe();

        assert_eq!(boiler.switch(State::On).unwrap(), State::On);
        assert_eq!(rx.try_recv().unwrap().state, State::On);

        let (from, to) = all_time();
        let history = boiler.switch_history(from, to).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, State::On);
    }

    #[test]
    fn idempotent_save_is_silent() {
        let boiler = boiler();
        boiler.switch(State::Off).unwrap();
        let mut rx = boiler.subscribe();

        boiler.switch(State::Off).unwrap();
        boiler.set_overheating_protection(false).unwrap();

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let (from, to) = all_time();
        assert_eq!(boiler.switch_history(from, to).unwrap().len(), 1);
        assert!(boiler.protection_history(from, to).unwrap().is_empty());
    }

    #[test]
    fn switch_to_unknown_is_rejected() {
        let boiler = boiler();
        let err = boiler.switch(State::Unknown).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(boiler.info().unwrap().state, State::Unknown);
    }

    #[test]
    fn protection_flag_records_samples() {
        let boiler = boiler();
        boiler.set_overheating_protection(true).unwrap();
        boiler.set_overheating_protection(false).unwrap();

        let (from, to) = all_time();
        let history = boiler.protection_history(from, to).unwrap();
        let flags: Vec<bool> = history.iter().map(|s| s.is_active).collect();
        assert_eq!(flags, vec![true, false]);
        let last = boiler.last_protection_sample_at(to).unwrap().unwrap();
        assert!(!last.is_active);
    }

    #[test]
    fn set_rule_generates_id_and_sorts() {
        let boiler = boiler();
        let a = boiler.set_rule(rule(20.0)).unwrap();
        let b = boiler.set_rule(rule(21.0)).unwrap();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);

        let rules = boiler.rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].id < rules[1].id);
    }

    #[test]
    fn set_rule_replaces_by_id() {
        let boiler = boiler();
        let mut r = boiler.set_rule(rule(20.0)).unwrap();
        r.target_temp = 22.0;
        boiler.set_rule(r.clone()).unwrap();

        let rules = boiler.rules().unwrap();
        assert_eq!(rules, vec![r]);
    }

    #[test]
    fn out_of_bounds_target_is_rejected() {
        let boiler = boiler();
        let err = boiler.set_rule(rule(30.0)).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.code(), "TEMPERATURE_OUT_OF_BOUNDS");
        assert!(boiler.rules().unwrap().is_empty());
    }

    #[test]
    fn invalid_repeat_day_is_rejected() {
        let boiler = boiler();
        let mut r = rule(20.0);
        r.repeat_days.insert(7);
        let err = boiler.set_rule(r).unwrap_err();
        assert_eq!(err.code(), "INVALID_RULE");
    }

    #[test]
    fn bounds_cannot_invert() {
        let boiler = boiler();
        assert_eq!(boiler.set_min_temp(26.0).unwrap_err().code(), "INVALID_BOUNDS");
        assert_eq!(boiler.set_max_temp(5.0).unwrap_err().code(), "INVALID_BOUNDS");

        let info = boiler.set_max_temp(22.0).unwrap();
        assert_eq!(info.max_temp, 22.0);
        let info = boiler.set_min_temp(15.0).unwrap();
        assert_eq!(info.min_temp, 15.0);
    }

    #[test]
    fn start_and_stop_rule() {
        let boiler = boiler();
        let r = boiler.set_rule(rule(20.0)).unwrap();

        boiler.stop_rule(&r.id).unwrap();
        let stopped = boiler.info().unwrap().rule(&r.id).cloned().unwrap();
        assert!(!stopped.is_active);
        assert!(stopped.stopped_time.is_some());

        boiler.start_rule(&r.id).unwrap();
        let started = boiler.info().unwrap().rule(&r.id).cloned().unwrap();
        assert!(started.is_active);
        assert!(started.stopped_time.is_none());
    }

    #[test]
    fn unknown_rule_is_not_found() {
        let boiler = boiler();
        for err in [
            boiler.start_rule("missing").unwrap_err(),
            boiler.stop_rule("missing").unwrap_err(),
            boiler.delete_rule("missing").unwrap_err(),
        ] {
            assert_eq!(err.code(), "RULE_NOT_FOUND");
        }
    }

    #[test]
    fn delete_rule_removes_it() {
        let boiler = boiler();
        let r = boiler.set_rule(rule(20.0)).unwrap();
        boiler.delete_rule(&r.id).unwrap();
        assert!(boiler.rules().unwrap().is_empty());
    }

    #[test]
    fn aggregate_survives_reopen_of_handle() {
        let boiler = boiler();
        boiler.set_rule(rule(20.0)).unwrap();
        let clone = boiler.clone();
        assert_eq!(clone.rules().unwrap().len(), 1);
    }
}

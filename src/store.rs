//! Persistence of campaigns, iteration results and injection records.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::record::{Campaign, Injection, IterationResult};

/// Shared by all workers of a campaign.
pub trait ResultStore: Send + Sync {
    fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;

    fn insert_result(&self, result: &IterationResult) -> Result<()>;

    fn insert_injection(&self, injection: &Injection) -> Result<()>;

    fn campaign(&self, campaign_id: u64) -> Result<Option<Campaign>>;

    fn results(&self, campaign_id: u64) -> Result<Vec<IterationResult>>;

    /// Results of the given iteration numbers only.
    fn results_in(&self, campaign_id: u64, iterations: Range<u64>) -> Result<Vec<IterationResult>> {
        let mut results = self.results(campaign_id)?;
        results.retain(|result| iterations.contains(&result.iteration));
        Ok(results)
    }

    /// Injections of one iteration ordered by injection number.
    fn injections(&self, campaign_id: u64, iteration: u64) -> Result<Vec<Injection>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredRecord {
    Campaign(Campaign),
    Result(IterationResult),
    Injection(Injection),
}

fn select_results(records: &[StoredRecord], campaign_id: u64) -> Vec<IterationResult> {
    let mut results: Vec<IterationResult> = records
        .iter()
        .filter_map(|record| match record {
            StoredRecord::Result(result) if result.campaign_id == campaign_id => Some(result.clone()),
            _ => None,
        })
        .collect();
    results.sort_by_key(|result| result.iteration);
    results
}

fn select_injections(records: &[StoredRecord], campaign_id: u64, iteration: u64) -> Vec<Injection> {
    let mut injections: Vec<Injection> = records
        .iter()
        .filter_map(|record| match record {
            StoredRecord::Injection(injection)
                if injection.campaign_id == campaign_id && injection.iteration == iteration =>
            {
                Some(injection.clone())
            }
            _ => None,
        })
        .collect();
    injections.sort_by_key(|injection| injection.injection_number);
    injections
}

fn select_campaign(records: &[StoredRecord], campaign_id: u64) -> Option<Campaign> {
    records.iter().rev().find_map(|record| match record {
        StoredRecord::Campaign(campaign) if campaign.id == campaign_id => Some(campaign.clone()),
        _ => None,
    })
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: StoredRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    fn with_records<T>(&self, f: impl FnOnce(&[StoredRecord]) -> T) -> T {
        f(&self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ResultStore for MemoryStore {
    fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.push(StoredRecord::Campaign(campaign.clone()));
        Ok(())
    }

    fn insert_result(&self, result: &IterationResult) -> Result<()> {
        self.push(StoredRecord::Result(result.clone()));
        Ok(())
    }

    fn insert_injection(&self, injection: &Injection) -> Result<()> {
        self.push(StoredRecord::Injection(injection.clone()));
        Ok(())
    }

    fn campaign(&self, campaign_id: u64) -> Result<Option<Campaign>> {
        Ok(self.with_records(|records| select_campaign(records, campaign_id)))
    }

    fn results(&self, campaign_id: u64) -> Result<Vec<IterationResult>> {
        Ok(self.with_records(|records| select_results(records, campaign_id)))
    }

    fn injections(&self, campaign_id: u64, iteration: u64) -> Result<Vec<Injection>> {
        Ok(self.with_records(|records| select_injections(records, campaign_id, iteration)))
    }
}

/// Append-only file with one JSON record per line.
pub struct JsonLinesStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &StoredRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<StoredRecord>> {
        // Hold the writer lock so no half-written line is read.
        let _guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(records)
    }
}

impl ResultStore for JsonLinesStore {
    fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.append(&StoredRecord::Campaign(campaign.clone()))
    }

    fn insert_result(&self, result: &IterationResult) -> Result<()> {
        self.append(&StoredRecord::Result(result.clone()))
    }

    fn insert_injection(&self, injection: &Injection) -> Result<()> {
        self.append(&StoredRecord::Injection(injection.clone()))
    }

    fn campaign(&self, campaign_id: u64) -> Result<Option<Campaign>> {
        Ok(select_campaign(&self.records()?, campaign_id))
    }

    fn results(&self, campaign_id: u64) -> Result<Vec<IterationResult>> {
        Ok(select_results(&self.records()?, campaign_id))
    }

    fn injections(&self, campaign_id: u64, iteration: u64) -> Result<Vec<Injection>> {
        Ok(select_injections(&self.records()?, campaign_id, iteration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{InjectionPoint, OutcomeCategory};
    use crate::targets::InjectionSite;
    use std::time::Duration;

    fn injection(iteration: u64, number: usize) -> Injection {
        let site = InjectionSite {
            target: "GPR".to_string(),
            target_index: None,
            register: "r3".to_string(),
            register_alias: None,
            register_index: vec![],
            field: None,
            bit: number as u32,
            core: 0,
        };
        Injection::new(1, iteration, number, site, InjectionPoint::Time(Duration::from_millis(5)), 0)
    }

    #[test]
    fn json_lines_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("campaign.jsonl");
        {
            let store = JsonLinesStore::open(&path).unwrap();
            store.insert_injection(&injection(2, 1)).unwrap();
            store.insert_injection(&injection(2, 0)).unwrap();
            store.insert_injection(&injection(3, 0)).unwrap();
            let mut result = IterationResult::new(1, 2);
            result.outcome = "Silent data error".to_string();
            result.outcome_category = OutcomeCategory::DataError;
            store.insert_result(&result).unwrap();
        }
        let store = JsonLinesStore::open(&path).unwrap();
        let injections = store.injections(1, 2).unwrap();
        assert_eq!(injections.iter().map(|i| i.injection_number).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(injections[1].injected_value, 0b10);
        let results = store.results(1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome_category, OutcomeCategory::DataError);
        assert!(store.results(2).unwrap().is_empty());
    }

    #[test]
    fn memory_store_filters_by_campaign() {
        let store = MemoryStore::new();
        store.insert_result(&IterationResult::new(1, 4)).unwrap();
        store.insert_result(&IterationResult::new(1, 3)).unwrap();
        store.insert_result(&IterationResult::new(2, 1)).unwrap();
        let iterations: Vec<u64> = store.results(1).unwrap().iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![3, 4]);
        assert!(store.campaign(1).unwrap().is_none());
    }

    #[test]
    fn results_of_one_run() {
        let store = MemoryStore::new();
        for iteration in 1..=6 {
            store.insert_result(&IterationResult::new(1, iteration)).unwrap();
        }
        let iterations: Vec<u64> = store.results_in(1, 3..5).unwrap().iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![3, 4]);
        assert!(store.results_in(1, 7..9).unwrap().is_empty());
    }
}

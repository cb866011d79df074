//! Metadata structures for cells

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, ZinbDiffError};

/// Cell-level metadata containing experimental conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellMetadata {
    /// Cell identifiers
    cell_ids: Vec<String>,
    /// Experimental conditions (column name -> values for each cell)
    conditions: HashMap<String, Vec<String>>,
}

impl CellMetadata {
    /// Create new cell metadata
    pub fn new(cell_ids: Vec<String>) -> Self {
        {
            let mut seen = std::collections::HashSet::new();
            for id in &cell_ids {
                if !seen.insert(id) {
                    log::warn!("Duplicate cell ID detected: '{}'. Cell IDs should be unique.", id);
                }
            }
        }
        Self {
            cell_ids,
            conditions: HashMap::new(),
        }
    }

    /// Add a condition column (categorical factor)
    pub fn add_condition(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.cell_ids.len() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} values", self.cell_ids.len()),
                got: format!("{} values", values.len()),
            });
        }
        self.conditions.insert(name.to_string(), values);
        Ok(())
    }

    /// Check if a condition exists
    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }

    /// Get the value of a condition for a specific cell
    pub fn get_value(&self, condition: &str, cell_idx: usize) -> Result<String> {
        self.conditions
            .get(condition)
            .and_then(|v| v.get(cell_idx))
            .cloned()
            .ok_or_else(|| ZinbDiffError::InvalidInput {
                reason: format!("condition '{}' or cell index {} not found", condition, cell_idx),
            })
    }

    /// Get cell IDs
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Get number of cells
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Get condition values for a specific column
    pub fn condition(&self, name: &str) -> Option<&Vec<String>> {
        self.conditions.get(name)
    }

    /// Get all condition names
    pub fn condition_names(&self) -> Vec<&str> {
        self.conditions.keys().map(|s| s.as_str()).collect()
    }

    /// Get unique levels for a condition (sorted)
    pub fn levels(&self, condition_name: &str) -> Option<Vec<String>> {
        self.conditions.get(condition_name).map(|values| {
            let mut unique: Vec<String> = values.iter().cloned().collect();
            unique.sort();
            unique.dedup();
            unique
        })
    }

    /// Get cell indices for a specific condition level
    pub fn cells_with_level(&self, condition_name: &str, level: &str) -> Vec<usize> {
        self.conditions
            .get(condition_name)
            .map(|values| {
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.as_str() == level)
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subset metadata to specific cells
    pub fn subset(&self, cell_indices: &[usize]) -> Result<Self> {
        let new_ids: Vec<String> = cell_indices
            .iter()
            .map(|&i| self.cell_ids[i].clone())
            .collect();

        let mut new_meta = CellMetadata::new(new_ids);

        for (name, values) in &self.conditions {
            let new_values: Vec<String> = cell_indices
                .iter()
                .map(|&i| values[i].clone())
                .collect();
            new_meta.add_condition(name, new_values)?;
        }

        Ok(new_meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_metadata() {
        let mut meta = CellMetadata::new(vec![
            "c1".to_string(),
            "c2".to_string(),
            "c3".to_string(),
            "c4".to_string(),
        ]);

        meta.add_condition(
            "group",
            vec![
                "ctrl".to_string(),
                "ctrl".to_string(),
                "stim".to_string(),
                "stim".to_string(),
            ],
        )
        .unwrap();

        let levels = meta.levels("group").unwrap();
        assert_eq!(levels, vec!["ctrl", "stim"]);

        let ctrl_cells = meta.cells_with_level("group", "ctrl");
        assert_eq!(ctrl_cells, vec![0, 1]);
    }

    #[test]
    fn test_subset_preserves_conditions() {
        let mut meta =
            CellMetadata::new(vec!["c1".to_string(), "c2".to_string(), "c3".to_string()]);
        meta.add_condition(
            "group",
            vec!["a".to_string(), "b".to_string(), "a".to_string()],
        )
        .unwrap();

        let sub = meta.subset(&[0, 2]).unwrap();
        assert_eq!(sub.n_cells(), 2);
        assert_eq!(
            sub.condition("group").unwrap(),
            &vec!["a".to_string(), "a".to_string()]
        );
    }
}

//! Load order for the recorder tables.
//!
//! Tables form a DAG through their foreign keys. The graph is validated once
//! at construction (unknown dependencies and cycles are configuration errors
//! raised before any database I/O) and is read-only afterwards.

use std::collections::{HashMap, HashSet};

use crate::core::TableSpec;
use crate::error::{MigrateError, Result};

/// Validated dependency graph over a set of tables.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Tables in their original (catalog) order.
    tables: Vec<TableSpec>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names, unknown dependencies and cycles.
    ///
    /// A dependency of a table on itself is a self-referencing foreign key,
    /// not an ordering constraint, and is dropped.
    pub fn new(tables: Vec<TableSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if index.insert(table.name.clone(), i).is_some() {
                return Err(MigrateError::Config(format!(
                    "table {} is listed twice",
                    table.name
                )));
            }
        }

        let mut tables = tables;
        for table in &mut tables {
            let name = table.name.clone();
            let mut seen = HashSet::new();
            table
                .dependencies
                .retain(|d| d != &name && seen.insert(d.clone()));
            if let Some(dep) = table.dependencies.iter().find(|d| !index.contains_key(*d)) {
                return Err(MigrateError::UnknownTable(format!(
                    "{} (dependency of {})",
                    dep, table.name
                )));
            }
        }

        let graph = Self { tables, index };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Restrict the graph to `names`. Dependencies outside the selection are
    /// dropped so the selected tables can run on their own.
    pub fn subgraph(&self, names: &[String]) -> Result<Self> {
        let selected: HashSet<&str> = names.iter().map(String::as_str).collect();
        if let Some(unknown) = names.iter().find(|n| !self.index.contains_key(n.as_str())) {
            return Err(MigrateError::UnknownTable(unknown.clone()));
        }

        let tables = self
            .tables
            .iter()
            .filter(|t| selected.contains(t.name.as_str()))
            .cloned()
            .map(|mut t| {
                t.dependencies.retain(|d| selected.contains(d.as_str()));
                t
            })
            .collect();
        Self::new(tables)
    }

    /// Tables grouped into tiers: tier *i* depends only on tiers before it,
    /// and tables within a tier are mutually independent.
    pub fn topological_tiers(&self) -> Vec<Vec<TableSpec>> {
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.tables.len());
        let mut tiers = Vec::new();

        while placed.len() < self.tables.len() {
            let tier: Vec<&TableSpec> = self
                .tables
                .iter()
                .filter(|t| !placed.contains(t.name.as_str()))
                .filter(|t| t.dependencies.iter().all(|d| placed.contains(d.as_str())))
                .collect();
            if tier.is_empty() {
                // unreachable after check_acyclic
                break;
            }
            placed.extend(tier.iter().map(|t| t.name.as_str()));
            tiers.push(tier.into_iter().cloned().collect());
        }

        tiers
    }

    /// Tables that are neither completed nor started and whose dependencies
    /// have all completed, in catalog order.
    pub fn ready(&self, completed: &HashSet<String>, started: &HashSet<String>) -> Vec<TableSpec> {
        self.tables
            .iter()
            .filter(|t| !completed.contains(&t.name) && !started.contains(&t.name))
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            i: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            match marks[i] {
                Mark::Done => return None,
                Mark::Active => {
                    let start = path.iter().position(|&p| p == i).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .map(|&p| graph.tables[p].name.clone())
                        .collect();
                    cycle.push(graph.tables[i].name.clone());
                    return Some(cycle);
                }
                Mark::New => {}
            }

            marks[i] = Mark::Active;
            path.push(i);
            for dep in &graph.tables[i].dependencies {
                let j = graph.index[dep];
                if let Some(cycle) = visit(graph, j, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.tables.len()];
        let mut path = Vec::new();
        for i in 0..self.tables.len() {
            if let Some(cycle) = visit(self, i, &mut marks, &mut path) {
                return Err(MigrateError::CyclicDependency(cycle));
            }
        }
        Ok(())
    }
}

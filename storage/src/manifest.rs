use std::collections::{BTreeMap, HashMap};

use common::BlockNum;
use serde::{Deserialize, Serialize};

use crate::kv::UpdatePolicy;

/// A named computation in the module DAG. `map` modules are stateless;
/// `store` modules accumulate persisted key-value state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Stable hash derived from the module's code and inputs. Durable-storage
    /// paths are keyed on it.
    pub hash: String,
    pub kind: ModuleKind,
    /// The first block at which the module can be evaluated.
    pub initial_block: BlockNum,
    /// Names of the modules whose outputs this module consumes.
    pub inputs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Map,
    Store { update_policy: UpdatePolicy },
}

impl Module {
    pub fn is_store(&self) -> bool {
        matches!(self.kind, ModuleKind::Store { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("module {0:?} is declared more than once")]
    DuplicateModule(String),

    #[error("module {module:?} has unknown input {input:?}")]
    UnknownInput { module: String, input: String },

    #[error("unknown module {0:?}")]
    UnknownModule(String),

    #[error("dependency cycle through module {0:?}")]
    Cycle(String),
}

/// A validated module DAG. Answers ancestry and depth queries for the work
/// plan.
#[derive(Clone, Debug)]
pub struct ModuleGraph {
    modules: BTreeMap<String, Module>,
}

impl ModuleGraph {
    pub fn new(modules: Vec<Module>) -> Result<Self, GraphError> {
        let mut map = BTreeMap::new();
        for module in modules {
            let name = module.name.clone();
            if map.insert(name.clone(), module).is_some() {
                return Err(GraphError::DuplicateModule(name));
            }
        }

        let graph = ModuleGraph { modules: map };
        for module in graph.modules.values() {
            for input in &module.inputs {
                if !graph.modules.contains_key(input) {
                    return Err(GraphError::UnknownInput {
                        module: module.name.clone(),
                        input: input.clone(),
                    });
                }
            }
            // Walking the depth visits every ancestor; a cycle surfaces here.
            graph.depth_of(&module.name, &mut HashMap::new(), &mut Vec::new())?;
        }
        Ok(graph)
    }

    pub fn get(&self, name: &str) -> Result<&Module, GraphError> {
        self.modules
            .get(name)
            .ok_or_else(|| GraphError::UnknownModule(name.to_string()))
    }

    /// Direct inputs of `name`.
    pub fn ancestors(&self, name: &str) -> Result<&[String], GraphError> {
        Ok(&self.get(name)?.inputs)
    }

    /// Direct inputs of `name`, restricted to store modules.
    pub fn store_ancestors(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        let mut out = Vec::new();
        for input in &self.get(name)?.inputs {
            let module = self.get(input)?;
            if module.is_store() {
                out.push(module);
            }
        }
        Ok(out)
    }

    /// Every store module in the transitive ancestry of `output`, including
    /// `output` itself when it is a store. Ordered by name.
    pub fn stores_down_to(&self, output: &str) -> Result<Vec<&Module>, GraphError> {
        let mut seen = BTreeMap::new();
        let mut stack = vec![output.to_string()];
        while let Some(name) = stack.pop() {
            let module = self.get(&name)?;
            if seen.insert(name, module).is_some() {
                continue;
            }
            stack.extend(module.inputs.iter().cloned());
        }
        Ok(seen.into_values().filter(|m| m.is_store()).collect())
    }

    /// The longest ancestor chain ending at `name`, counting `name` itself:
    /// a module with no inputs has depth 1.
    pub fn ancestors_depth(&self, name: &str) -> Result<usize, GraphError> {
        self.depth_of(name, &mut HashMap::new(), &mut Vec::new())
    }

    /// The largest `ancestors_depth` across `modules`.
    pub fn highest_dependency_depth<'a>(
        &self,
        modules: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, GraphError> {
        let mut memo = HashMap::new();
        let mut highest = 0;
        for name in modules {
            let depth = self.depth_of(name, &mut memo, &mut Vec::new())?;
            highest = highest.max(depth);
        }
        Ok(highest)
    }

    fn depth_of(
        &self,
        name: &str,
        memo: &mut HashMap<String, usize>,
        visiting: &mut Vec<String>,
    ) -> Result<usize, GraphError> {
        if let Some(depth) = memo.get(name) {
            return Ok(*depth);
        }
        if visiting.iter().any(|n| n == name) {
            return Err(GraphError::Cycle(name.to_string()));
        }
        visiting.push(name.to_string());
        let mut depth = 1;
        for input in &self.get(name)?.inputs {
            depth = depth.max(1 + self.depth_of(input, memo, visiting)?);
        }
        visiting.pop();
        memo.insert(name.to_string(), depth);
        Ok(depth)
    }
}

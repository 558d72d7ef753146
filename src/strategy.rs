use serde::Serialize;

use crate::domain::RecipeDescriptor;

/// Files a pre-staged artifact is known to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedArtifact {
    pub final_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Replay a pre-staged artifact without dependency resolution.
    CachedReplay(CachedArtifact),
    /// Let the package manager resolve and run the recipe.
    SolverBased,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::CachedReplay(_) => "cached",
            Strategy::SolverBased => "solver",
        }
    }
}

/// Meta-recipes carry an install-time identity, so they never replay a cache.
pub fn select_strategy(recipe: &RecipeDescriptor) -> Strategy {
    if recipe.tags.is_cached() && !recipe.is_meta_recipe() {
        Strategy::CachedReplay(CachedArtifact {
            final_files: recipe.tags.final_files.clone(),
        })
    } else {
        Strategy::SolverBased
    }
}

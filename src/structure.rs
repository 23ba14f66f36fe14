//! Structure planner. Decides the algebraic path once, from the
//! composition of components and the likelihood kind, and emits capability
//! flags consulted by every later stage.

use crate::component::{ComponentKind, ComponentRegistry};
use crate::error::{GpremError, Result};

/// The algebraic path chosen for one cluster/model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureTag {
    DenseChol,
    SparseChol,
    GroupedWoodbury,
    SingleGroupedOnReScale,
    SingleGpOnReScale,
    Vecchia,
    Fitc,
}

/// Capability flags emitted by the planner, consulted by every downstream
/// stage (covariance assembly, Laplace solving, gradients, optimization,
/// prediction).
#[derive(Debug, Clone, Copy)]
pub struct StructureFlags {
    pub tag: StructureTag,
    pub gauss_likelihood: bool,
    pub only_grouped_res_use_woodbury: bool,
    pub only_one_grouped_re_on_re_scale: bool,
    pub only_one_grouped_re_on_re_scale_for_prediction: bool,
    pub only_one_gp_on_re_scale: bool,
    pub vecchia: bool,
    pub fitc: bool,
}

/// Hint describing which special-case algebraic path to prefer when the
/// component composition would otherwise be ambiguous (e.g. a single GP
/// component could use either dense-Chol or Vecchia/FITC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPreference {
    Dense,
    Sparse,
    Vecchia,
    Fitc,
}

pub struct StructurePlanner;

impl StructurePlanner {
    /// Validate the component composition and choose a [`StructureTag`].
    pub fn plan(
        registry: &ComponentRegistry,
        gauss_likelihood: bool,
        preference: PathPreference,
    ) -> Result<StructureFlags> {
        let components = &registry.components;
        if components.is_empty() {
            return Err(GpremError::IncompatibleStructure(
                "at least one random-effect component is required".into(),
            ));
        }

        let has_grouped = components.iter().any(|c| c.kind.is_grouped());
        let has_gp = components.iter().any(|c| c.kind.is_gp());
        let n_grouped = components.iter().filter(|c| c.kind.is_grouped()).count();
        let n_gp = components.iter().filter(|c| c.kind.is_gp()).count();
        let single_grouped_intercept = n_grouped == 1
            && !has_gp
            && components[0].kind == ComponentKind::GroupedIntercept;
        let single_gp_intercept =
            n_gp == 1 && !has_grouped && components[0].kind == ComponentKind::GpIntercept;

        let wants_vecchia = preference == PathPreference::Vecchia;
        let wants_fitc = preference == PathPreference::Fitc;

        if wants_vecchia && has_grouped {
            return Err(GpremError::IncompatibleStructure(
                "Vecchia is incompatible with grouped random-effect components".into(),
            ));
        }
        if wants_fitc && has_grouped {
            return Err(GpremError::IncompatibleStructure(
                "FITC is incompatible with grouped random-effect components".into(),
            ));
        }

        let only_grouped_res_use_woodbury = has_grouped && !has_gp && !wants_vecchia && !wants_fitc;
        if only_grouped_res_use_woodbury && has_gp {
            return Err(GpremError::IncompatibleStructure(
                "only_grouped_REs_use_woodbury requires no GP components".into(),
            ));
        }

        let only_one_grouped_re_on_re_scale = single_grouped_intercept && !gauss_likelihood;
        let only_one_grouped_re_on_re_scale_for_prediction = single_grouped_intercept && gauss_likelihood;
        let only_one_gp_on_re_scale =
            single_gp_intercept && !wants_vecchia && !wants_fitc && preference == PathPreference::Dense;

        let tag = if wants_vecchia {
            StructureTag::Vecchia
        } else if wants_fitc {
            StructureTag::Fitc
        } else if only_one_grouped_re_on_re_scale || only_one_grouped_re_on_re_scale_for_prediction {
            StructureTag::SingleGroupedOnReScale
        } else if only_grouped_res_use_woodbury {
            StructureTag::GroupedWoodbury
        } else if only_one_gp_on_re_scale {
            StructureTag::SingleGpOnReScale
        } else if preference == PathPreference::Sparse {
            StructureTag::SparseChol
        } else {
            StructureTag::DenseChol
        };

        log::debug!(
            "structure planner: {n_grouped} grouped, {n_gp} GP component(s), gauss={gauss_likelihood} -> {tag:?}"
        );

        Ok(StructureFlags {
            tag,
            gauss_likelihood,
            only_grouped_res_use_woodbury,
            only_one_grouped_re_on_re_scale,
            only_one_grouped_re_on_re_scale_for_prediction,
            only_one_gp_on_re_scale,
            vecchia: wants_vecchia,
            fitc: wants_fitc,
        })
    }
}

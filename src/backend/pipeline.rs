// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The analysis pipeline: merged sketches in, deployment package out.
//!
//! Operator-triggered, and the one place where an error is fatal to the
//! run: the steady-state ingest path never passes through here. Two
//! stages:
//!
//! 1. **Categorization**: identity enrichment, feature extraction,
//!    density clustering, labeling, SGT taxonomy, lifecycle assignment,
//!    and persistence of the incremental model artifact (centroids plus
//!    frozen scaler).
//! 2. **Policy generation**: matrix build over observed flows, SGACL
//!    generation, impact analysis, package assembly.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    clustering::{
        batch::{ClusterResult, DensityClusterer, NOISE},
        confidence,
        features::FeatureExtractor,
        incremental::centroids_from_result,
        labeling::{ClusterLabel, SemanticLabeler, generate_explanation},
    },
    flow::FlowRecord,
    identity::{DirectoryLookups, IdentityResolver},
    policy::{
        exporter::{DeploymentPackage, build_package},
        impact::{ImpactAnalyzer, ImpactReport},
        matrix::{PolicyMatrix, PolicyMatrixBuilder},
        sgacl::{SgaclGenerator, SgaclPolicy},
    },
    sgt::{
        AssignmentSource, SgtCategory,
        lifecycle::{SgtError, SgtLifecycle},
        mapper::{SgtMapper, SgtTaxonomy},
    },
    sketches::endpoint::EndpointSketch,
    storage::{IdentityRecord, Storage},
};

/// Everything the categorization stage produced, input to the policy
/// stage.
pub struct CategorizationOutcome {
    pub result: ClusterResult,
    pub labels: BTreeMap<i64, ClusterLabel>,
    pub taxonomy: SgtTaxonomy,
    /// endpoint id → cluster id, for the matrix builder.
    pub endpoint_to_cluster: HashMap<String, i64>,
    /// Feature rows dropped for non-finite values.
    pub dropped_records: usize,
}

/// Policy stage output.
pub struct PolicyOutcome {
    pub matrix: PolicyMatrix,
    pub policies: Vec<SgaclPolicy>,
    pub impact: ImpactReport,
    pub package: DeploymentPackage,
}

pub struct AnalysisPipeline<'a, S: Storage> {
    cfg: &'a Config,
    storage: &'a S,
}

impl<'a, S: Storage> AnalysisPipeline<'a, S> {
    pub fn new(cfg: &'a Config, storage: &'a S) -> Self {
        Self { cfg, storage }
    }

    /// Runs enrichment, clustering, labeling, taxonomy, and lifecycle
    /// assignment over the merged sketch set.
    pub fn categorize(
        &self,
        sketches: &mut [EndpointSketch],
        directory: &dyn DirectoryLookups,
    ) -> Result<CategorizationOutcome> {
        info!(endpoints = sketches.len(), "categorization starting");

        // Identity enrichment; failures are silent and graded.
        let resolver = IdentityResolver::new(directory);
        let contexts = resolver.enrich_all(sketches);
        let now = Utc::now();
        for ctx in &contexts {
            self.storage.upsert_identity(IdentityRecord {
                endpoint_id: ctx.endpoint_id.clone(),
                username: ctx.username.clone(),
                ad_groups: ctx.ad_groups.clone(),
                ise_profile: ctx.ise_profile.clone(),
                device_type: ctx.device_type.clone(),
                confidence: ctx.confidence,
                resolved_at: now,
            });
        }

        // Features. A stored scaler means a prior run froze the space;
        // reuse it so centroids stay comparable.
        let mut extractor = match self.storage.get_scaler() {
            Some(scaler) => FeatureExtractor::with_scaler(scaler),
            None => FeatureExtractor::new(),
        };
        let mut features = extractor.extract_all(sketches);
        let before = features.len();
        features.retain(|f| f.is_finite());
        let dropped_records = before - features.len();
        if dropped_records > 0 {
            warn!(dropped_records, "non-finite feature vectors dropped");
        }

        let (matrix, endpoint_ids) = extractor.to_matrix(&features);

        // Batch clustering.
        let clusterer = DensityClusterer::new(&self.cfg.clustering);
        let result = clusterer.cluster(&matrix, &endpoint_ids);

        // Labels and explanations.
        let by_id: HashMap<String, EndpointSketch> = sketches
            .iter()
            .map(|s| (s.endpoint_id.clone(), s.clone()))
            .collect();
        let labeler = SemanticLabeler::default();
        let labels = labeler.label_clusters(&by_id, &result);
        for label in labels.values() {
            let explanation = generate_explanation(label);
            self.storage.store_cluster_label(label.clone(), explanation);
        }

        // Taxonomy.
        let mut mapper = SgtMapper::new(self.cfg.clustering.min_sgt_cluster_size);
        let taxonomy = mapper.generate_taxonomy(&result, &labels);

        // Persist the incremental model artifact: centroids carry their
        // SGT values, the scaler freezes the feature space.
        let cluster_to_sgt = taxonomy.cluster_to_sgt();
        for mut centroid in centroids_from_result(&result, &matrix, now) {
            centroid.sgt_value = cluster_to_sgt.get(&centroid.cluster_id).copied();
            self.storage.store_centroid(centroid);
        }
        if let Some(scaler) = extractor.scaler() {
            self.storage.store_scaler(scaler.clone());
        }

        // Lifecycle: registry entries plus memberships, replaced
        // wholesale by this run.
        self.apply_to_lifecycle(&result, &taxonomy)?;

        let endpoint_to_cluster: HashMap<String, i64> = result
            .endpoint_ids
            .iter()
            .cloned()
            .zip(result.labels.iter().copied())
            .collect();

        info!(
            clusters = result.n_clusters,
            noise = result.n_noise,
            sgts = taxonomy.n_sgts,
            "categorization complete"
        );

        Ok(CategorizationOutcome {
            result,
            labels,
            taxonomy,
            endpoint_to_cluster,
            dropped_records,
        })
    }

    fn apply_to_lifecycle(
        &self,
        result: &ClusterResult,
        taxonomy: &SgtTaxonomy,
    ) -> Result<()> {
        let lifecycle = SgtLifecycle::new(self.storage);

        for rec in &taxonomy.recommendations {
            match lifecycle.create_sgt(
                rec.sgt_value,
                rec.sgt_name.clone(),
                Some(rec.category),
                Some(rec.justification.clone()),
            ) {
                Ok(_) => {},
                // A brownfield entry already holds this value; reuse it
                // rather than invent a conflicting one.
                Err(SgtError::DuplicateSgt(value)) => {
                    info!(sgt = value, "reusing existing registry entry");
                },
                Err(e) => return Err(e).context("registry update failed"),
            }
        }

        let probabilities = result.probabilities.as_deref();
        for rec in &taxonomy.recommendations {
            let cluster_size = result
                .cluster_sizes
                .get(&rec.cluster_id)
                .copied()
                .unwrap_or(0);

            for (idx, (endpoint_id, &label)) in result
                .endpoint_ids
                .iter()
                .zip(&result.labels)
                .enumerate()
            {
                if label != rec.cluster_id {
                    continue;
                }
                let probability = probabilities.map(|p| p[idx]);
                let conf = confidence::for_cluster_assignment(
                    label,
                    None,
                    probability,
                    Some(cluster_size),
                    result.silhouette,
                );
                lifecycle
                    .assign_endpoint(
                        endpoint_id,
                        rec.sgt_value,
                        AssignmentSource::Clustering,
                        Some(confidence::for_sgt_assignment(
                            conf,
                            None,
                            self.storage.history_of(endpoint_id).len(),
                        )),
                        Some(rec.cluster_id),
                    )
                    .context("endpoint assignment failed")?;
            }
        }

        Ok(())
    }

    /// Builds the matrix over observed flows and generates the
    /// enforcement-ready artifact.
    pub fn generate_policies(
        &self,
        flows: &[FlowRecord],
        outcome: &CategorizationOutcome,
        ip_to_endpoint: &HashMap<String, String>,
        ip_to_service: &HashMap<String, String>,
    ) -> Result<PolicyOutcome> {
        info!(flows = flows.len(), "policy generation starting");

        self.ensure_service_sgt().context("service SGT setup failed")?;

        let cluster_to_sgt = outcome.taxonomy.cluster_to_sgt();
        let mut sgt_names: BTreeMap<u16, String> = outcome
            .taxonomy
            .recommendations
            .iter()
            .map(|r| (r.sgt_value, r.sgt_name.clone()))
            .collect();
        sgt_names
            .entry(crate::policy::matrix::SERVICE_SGT)
            .or_insert_with(|| "Servers".to_string());

        let builder = PolicyMatrixBuilder::new(
            &outcome.endpoint_to_cluster,
            &cluster_to_sgt,
            &sgt_names,
            ip_to_endpoint,
            ip_to_service,
        );
        let matrix = builder.build(flows);
        for cell in matrix.cells.values() {
            self.storage.store_matrix_cell(cell.clone());
        }

        let generator = SgaclGenerator::new(&self.cfg.policy);
        let policies = generator.generate(&matrix);
        for policy in &policies {
            self.storage.store_policy(policy.clone());
        }

        let analyzer = ImpactAnalyzer::new(&self.cfg.policy);
        let impact = analyzer.analyze(&matrix, &policies);
        if impact.has_critical_issues() {
            warn!(
                critical = impact.critical_blocks,
                "impact analysis found critical blocks; deployment gated"
            );
        }

        let lifecycle = SgtLifecycle::new(self.storage);
        let sgts = lifecycle.list_sgts(true);
        let package = build_package(&sgts, &policies, impact.clone());

        Ok(PolicyOutcome {
            matrix,
            policies,
            impact,
            package,
        })
    }

    /// The streaming path between batch runs: assign new endpoints to
    /// stored centroids, record memberships, and fold the newcomers into
    /// the running centroid means.
    pub fn assign_incremental(
        &self,
        sketches: &[EndpointSketch],
    ) -> Result<Vec<crate::clustering::incremental::Assignment>> {
        let clusterer = crate::clustering::incremental::IncrementalClusterer::load_from_storage(
            self.storage,
            self.cfg.clustering.max_distance_threshold,
        );
        if !clusterer.has_centroids() {
            warn!("no centroids stored; run batch clustering first");
        }

        let assignments = clusterer.assign_bulk(sketches);

        let lifecycle = SgtLifecycle::new(self.storage);
        for assignment in &assignments {
            if assignment.cluster_id == NOISE {
                continue;
            }
            let Some(sgt_value) = assignment.sgt_value else {
                continue;
            };
            lifecycle
                .assign_endpoint(
                    &assignment.endpoint_id,
                    sgt_value,
                    AssignmentSource::Incremental,
                    Some(assignment.confidence),
                    Some(assignment.cluster_id),
                )
                .context("incremental assignment failed")?;
        }

        clusterer.persist(self.storage);
        Ok(assignments)
    }

    /// Ensures the well-known service SGT exists before a policy run in
    /// an environment with no clustered server group.
    pub fn ensure_service_sgt(&self) -> Result<(), SgtError> {
        let lifecycle = SgtLifecycle::new(self.storage);
        match lifecycle.create_sgt(
            crate::policy::matrix::SERVICE_SGT,
            "Servers",
            Some(SgtCategory::Servers),
            Some("Known service destinations".to_string()),
        ) {
            Ok(_) | Err(SgtError::DuplicateSgt(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

//! Fan-out of job definitions into schedulable job tasks.
//!
//! Each job kind owns its fan-out rule: builds and deploys expand per
//! service module, testing per test module, scanning per scanning, and a
//! freestyle job either once or per listed service. Expansion is a pure
//! function of the definition, so re-expanding the same arguments yields the
//! same task keys and names.

use std::collections::BTreeMap;

use conveyor_types::definition::{
    BuildJobSpec, DeployJobSpec, FreestyleJobSpec, JobDefinition, JobSpec, KeyVal,
    ScanningJobSpec, TestingJobSpec,
};
use conveyor_types::status::Status;
use conveyor_types::task::{JobTask, JobTaskSpec};

/// Expand one job definition.
///
/// `debug` pre-arms the `before` breakpoint on kinds that run a shell step.
pub fn expand_job(workflow: &str, job: &JobDefinition, debug: bool) -> Vec<JobTask> {
    let units: Vec<(String, JobTaskSpec)> = match &job.spec {
        JobSpec::Build(spec) => expand_build(&job.name, spec),
        JobSpec::Deploy(spec) => expand_deploy(&job.name, spec),
        JobSpec::Freestyle(spec) => expand_freestyle(&job.name, spec),
        JobSpec::Testing(spec) => expand_testing(&job.name, spec),
        JobSpec::Scanning(spec) => expand_scanning(&job.name, spec),
    };

    units
        .into_iter()
        .enumerate()
        .map(|(index, (name, spec))| JobTask {
            key: format!("{workflow}/{}/{index}", job.name),
            name,
            job_name: job.name.clone(),
            status: Status::Created,
            started_at: None,
            ended_at: None,
            error: None,
            optional: job.optional,
            timeout_minutes: job.timeout_minutes,
            breakpoint_before: debug && job.job_type().supports_debug(),
            breakpoint_after: false,
            spec,
            outputs: BTreeMap::new(),
            execution: None,
        })
        .collect()
}

/// `job-part-part`, skipping empty parts and repeated trailing parts.
fn unit_name(job: &str, parts: &[&str]) -> String {
    let mut name = job.to_string();
    let mut last: &str = "";
    for &part in parts.iter().filter(|p| !p.is_empty()) {
        if part != last {
            name.push('-');
            name.push_str(part);
        }
        last = part;
    }
    name
}

/// Job-level envs overlaid by unit-level envs with the same key.
fn overlay(base: &[KeyVal], unit: &[KeyVal]) -> Vec<KeyVal> {
    let mut merged: Vec<KeyVal> = base
        .iter()
        .filter(|kv| !unit.iter().any(|u| u.key == kv.key))
        .cloned()
        .collect();
    merged.extend(unit.iter().cloned());
    merged
}

fn expand_build(job: &str, spec: &BuildJobSpec) -> Vec<(String, JobTaskSpec)> {
    spec.services
        .iter()
        .map(|svc| {
            let build_name = if svc.build_name.is_empty() {
                format!("{}-{}", svc.service_name, svc.service_module)
            } else {
                svc.build_name.clone()
            };
            (
                unit_name(job, &[&svc.service_name, &svc.service_module]),
                JobTaskSpec::Build {
                    service_name: svc.service_name.clone(),
                    service_module: svc.service_module.clone(),
                    build_name,
                    branch: svc.branch.clone(),
                    script: spec.script.clone(),
                    envs: overlay(&spec.envs, &svc.envs),
                },
            )
        })
        .collect()
}

fn expand_deploy(job: &str, spec: &DeployJobSpec) -> Vec<(String, JobTaskSpec)> {
    spec.services
        .iter()
        .map(|svc| {
            (
                unit_name(job, &[&svc.service_name, &svc.service_module]),
                JobTaskSpec::Deploy {
                    env: spec.env.clone(),
                    production: spec.production,
                    service_name: svc.service_name.clone(),
                    service_module: svc.service_module.clone(),
                    image: svc.image.clone(),
                },
            )
        })
        .collect()
}

fn expand_freestyle(job: &str, spec: &FreestyleJobSpec) -> Vec<(String, JobTaskSpec)> {
    if spec.services.is_empty() {
        return vec![(
            job.to_string(),
            JobTaskSpec::Freestyle {
                script: spec.script.clone(),
                image: spec.image.clone(),
                envs: spec.envs.clone(),
                service: None,
            },
        )];
    }

    spec.services
        .iter()
        .map(|svc| {
            (
                unit_name(job, &[&svc.service_name, &svc.service_module]),
                JobTaskSpec::Freestyle {
                    script: spec.script.clone(),
                    image: spec.image.clone(),
                    envs: spec.envs.clone(),
                    service: Some(svc.clone()),
                },
            )
        })
        .collect()
}

fn expand_testing(job: &str, spec: &TestingJobSpec) -> Vec<(String, JobTaskSpec)> {
    spec.modules
        .iter()
        .map(|module| {
            (
                unit_name(job, &[&module.name]),
                JobTaskSpec::Testing {
                    module: module.name.clone(),
                    script: module.script.clone(),
                    envs: module.envs.clone(),
                },
            )
        })
        .collect()
}

fn expand_scanning(job: &str, spec: &ScanningJobSpec) -> Vec<(String, JobTaskSpec)> {
    spec.scannings
        .iter()
        .map(|scan| {
            (
                unit_name(job, &[&scan.name]),
                JobTaskSpec::Scanning {
                    name: scan.name.clone(),
                    script: scan.script.clone(),
                    repo: scan.repo.clone(),
                },
            )
        })
        .collect()
}

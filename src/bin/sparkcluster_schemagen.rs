use workload_operator::reconcilers::sparkcluster::SparkClusterWorkload;
use workload_operator::resources::crd::{build_crd, openapi_schema};
use workload_operator::resources::sparkclusters::SparkCluster;

/// Prints the SparkCluster CustomResourceDefinition, for clusters where the operator may not create CRDs
fn main() -> anyhow::Result<()> {
    let schema = openapi_schema::<SparkCluster>()?;
    let descriptor = SparkClusterWorkload::default_declaration().crd_descriptor(Some(schema.clone()));
    print!("{}", serde_yaml::to_string(&build_crd(&descriptor, Some(schema)))?);
    Ok(())
}

//! Conversion round trips through the public webhook entry points
//!
//! These run against raw JSON the way the API server sends objects, without
//! a cluster.

use kube::core::conversion::{ConversionRequest, ConversionReview};
use serde_json::{json, Value};

use capc::conversion::convert_object;
use capc::crd::{v1beta1, v1beta2, v1beta3};
use capc::webhook::conversion::convert_request;
use capc::CONVERSION_DATA_ANNOTATION;

// =============================================================================
// Test Fixtures
// =============================================================================

fn disk_offering(mount_path: &str) -> Value {
    json!({
        "id": "do-1",
        "name": "Custom",
        "customSize": 50,
        "mountPath": mount_path,
        "device": "/dev/vdb",
        "filesystem": "ext4",
        "label": "data_disk"
    })
}

fn hub_machine(mount_path: &str) -> Value {
    json!({
        "apiVersion": v1beta3::API_VERSION,
        "kind": "CloudStackMachine",
        "metadata": {"name": "cp-0", "namespace": "default"},
        "spec": {
            "offering": {"name": "Large"},
            "template": {"name": "ubuntu-2204-kube-v1.29"},
            "diskOffering": disk_offering(mount_path),
            "failureDomainName": "fd1"
        }
    })
}

fn hub_cluster() -> Value {
    json!({
        "apiVersion": v1beta3::API_VERSION,
        "kind": "CloudStackCluster",
        "metadata": {"name": "mycluster", "namespace": "default"},
        "spec": {
            "controlPlaneEndpoint": {"host": "203.0.113.10", "port": 6443},
            "failureDomains": [{
                "name": "fd1",
                "zone": {"id": "zone-1", "name": "zone1", "network": {"name": "net1"}},
                "acsEndpoint": {"name": "creds", "namespace": "default"}
            }],
            "apiServerLoadBalancer": {"enabled": false, "additionalPorts": [22]}
        }
    })
}

// =============================================================================
// Disk Offerings
// =============================================================================

/// Story: An unmounted data disk is not expressed at v1beta1
#[test]
fn story_unmounted_disk_is_absent_at_v1beta1() {
    let spoke = convert_object(hub_machine(""), v1beta1::API_VERSION).unwrap();
    assert_eq!(spoke["apiVersion"], v1beta1::API_VERSION);
    assert!(spoke["spec"].get("diskOffering").is_none());
    assert!(spoke["metadata"]["annotations"][CONVERSION_DATA_ANNOTATION].is_string());
}

/// Story: A mounted data disk survives a trip through v1beta1 unchanged
#[test]
fn story_mounted_disk_round_trips_through_v1beta1() {
    let spoke = convert_object(hub_machine("/data"), v1beta1::API_VERSION).unwrap();
    assert_eq!(spoke["spec"]["diskOffering"], disk_offering("/data"));

    let back = convert_object(spoke, v1beta3::API_VERSION).unwrap();
    assert_eq!(back["spec"]["diskOffering"], disk_offering("/data"));
    assert_eq!(back["spec"]["failureDomainName"], "fd1");
}

// =============================================================================
// Clusters
// =============================================================================

/// Story: Load-balancer settings invisible at v1beta2 come back from the stash
#[test]
fn story_cluster_round_trips_through_v1beta2() {
    let spoke = convert_object(hub_cluster(), v1beta2::API_VERSION).unwrap();
    assert!(spoke["spec"].get("apiServerLoadBalancer").is_none());

    let back = convert_object(spoke, v1beta3::API_VERSION).unwrap();
    assert_eq!(back["spec"], hub_cluster()["spec"]);
}

/// Story: Objects already at the desired version pass through untouched
#[test]
fn same_version_is_identity() {
    let hub = hub_cluster();
    assert_eq!(convert_object(hub.clone(), v1beta3::API_VERSION).unwrap(), hub);
}

// =============================================================================
// Conversion Reviews
// =============================================================================

fn review(objects: Vec<Value>, desired: &str) -> ConversionRequest {
    let review: ConversionReview = serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "ConversionReview",
        "request": {
            "uid": "0b4d7a6c-0000-4000-8000-000000000001",
            "desiredAPIVersion": desired,
            "objects": objects
        }
    }))
    .unwrap();
    ConversionRequest::from_review(review).unwrap()
}

/// Story: Every object of a review is converted in order
#[test]
fn story_review_converts_every_object() {
    let request = review(vec![hub_cluster(), hub_machine("/data")], v1beta1::API_VERSION);
    let response = serde_json::to_value(convert_request(request)).unwrap();

    assert_eq!(response["result"]["status"], "Success");
    let converted = response["convertedObjects"].as_array().unwrap();
    assert_eq!(converted.len(), 2);
    assert_eq!(converted[0]["kind"], "CloudStackCluster");
    assert_eq!(converted[1]["kind"], "CloudStackMachine");
    assert!(converted
        .iter()
        .all(|o| o["apiVersion"] == v1beta1::API_VERSION));
}

/// Story: One unconvertible object fails the whole review
#[test]
fn story_unsupported_kind_fails_review() {
    let failure_domain = json!({
        "apiVersion": v1beta3::API_VERSION,
        "kind": "CloudStackFailureDomain",
        "metadata": {"name": "mycluster-fd1"},
        "spec": {
            "name": "fd1",
            "zone": {"name": "zone1", "network": {"name": "net1"}},
            "acsEndpoint": {"name": "creds", "namespace": "default"}
        }
    });
    let request = review(vec![hub_cluster(), failure_domain], v1beta1::API_VERSION);
    let response = serde_json::to_value(convert_request(request)).unwrap();

    assert_eq!(response["result"]["status"], "Failure");
    assert!(response["convertedObjects"]
        .as_array()
        .map_or(true, |objects| objects.is_empty()));
}

//! CloudStackMachine conversions
//!
//! Hub-only fields: `failureDomainName`, `uncompressedUserData`,
//! `status.status` and `status.reason`. v1beta1 additionally cannot hold a
//! disk offering without a mount path; such an offering is dropped on the
//! way down and recovered from the stash on the way up.

use super::{map_fields, map_optional, marshal_stash, take_stash, Convertible, HubStash};
use crate::crd::{v1beta1, v1beta3 as hub};
use crate::Result;

type MachineStash = HubStash<hub::CloudStackMachineSpec, hub::CloudStackMachineStatus>;

impl Convertible for v1beta1::CloudStackMachine {
    type Hub = hub::CloudStackMachine;

    fn convert_to(&self) -> Result<Self::Hub> {
        let mut metadata = self.metadata.clone();
        let stash: Option<MachineStash> = take_stash(&mut metadata);
        let mut spec: hub::CloudStackMachineSpec = map_fields(&self.spec)?;
        let mut status: Option<hub::CloudStackMachineStatus> =
            map_optional(self.status.as_ref())?;

        if let Some(stash) = stash {
            spec.failure_domain_name = stash.spec.failure_domain_name;
            spec.uncompressed_user_data = stash.spec.uncompressed_user_data;
            // Only an unmounted offering is unrepresentable at v1beta1; a
            // mounted one missing here was removed by the user.
            let unmounted = stash
                .spec
                .disk_offering
                .filter(|d| d.mount_path.is_empty());
            if spec.disk_offering.is_none() && unmounted.is_some() {
                spec.disk_offering = unmounted;
            }

            if let Some(stashed) = stash.status {
                if stashed.status.is_some() || stashed.reason.is_some() {
                    let status = status.get_or_insert_with(Default::default);
                    status.status = stashed.status;
                    status.reason = stashed.reason;
                }
            }
        }

        Ok(hub::CloudStackMachine {
            metadata,
            spec,
            status,
        })
    }

    fn convert_from(hub: &Self::Hub, prior: Option<&Self>) -> Result<Self> {
        let mut metadata = hub.metadata.clone();
        marshal_stash(hub, &mut metadata)?;

        let mut spec: v1beta1::CloudStackMachineSpec = map_fields(&hub.spec)?;
        if spec
            .disk_offering
            .as_ref()
            .is_some_and(|d| d.mount_path.is_empty())
        {
            spec.disk_offering = None;
        }
        // Zone fields do not exist at the hub; keep what the caller last saw.
        match prior {
            Some(prior) => {
                spec.zone_id = prior.spec.zone_id.clone();
                spec.zone_name = prior.spec.zone_name.clone();
            }
            None => {
                spec.zone_id = String::new();
                spec.zone_name = String::new();
            }
        }

        Ok(Self {
            metadata,
            spec,
            status: map_optional(hub.status.as_ref())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DiskOffering, MachineAddress, ResourceIdentifier};
    use crate::CONVERSION_DATA_ANNOTATION;

    fn disk(mount_path: &str) -> DiskOffering {
        DiskOffering {
            id: "do-1".to_string(),
            name: "Custom".to_string(),
            custom_size: 50,
            mount_path: mount_path.to_string(),
            device: "/dev/vdb".to_string(),
            filesystem: "ext4".to_string(),
            label: "data_disk".to_string(),
        }
    }

    fn hub_machine(disk_offering: Option<DiskOffering>) -> hub::CloudStackMachine {
        let mut machine = hub::CloudStackMachine::new(
            "cp-0",
            hub::CloudStackMachineSpec {
                offering: ResourceIdentifier {
                    id: String::new(),
                    name: "Large".to_string(),
                },
                template: ResourceIdentifier {
                    id: String::new(),
                    name: "ubuntu-2204-kube-v1.29".to_string(),
                },
                disk_offering,
                failure_domain_name: "fd1".to_string(),
                uncompressed_user_data: Some(true),
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("default".to_string());
        machine.status = Some(hub::CloudStackMachineStatus {
            ready: true,
            instance_state: Some("Running".to_string()),
            addresses: vec![MachineAddress {
                type_: "InternalIP".to_string(),
                address: "10.1.1.5".to_string(),
            }],
            status: Some("Ready".to_string()),
            reason: Some("Machine is running".to_string()),
            failure_message: None,
        });
        machine
    }

    // ==========================================================================
    // Story Tests: Disk Offerings Across Versions
    // ==========================================================================

    /// Story: A hub machine without a data disk mount path has no disk
    /// offering at v1beta1
    #[test]
    fn story_empty_mount_path_has_no_spoke_disk_offering() {
        let spoke = v1beta1::CloudStackMachine::convert_from(&hub_machine(Some(disk(""))), None)
            .unwrap();
        assert!(spoke.spec.disk_offering.is_none());
    }

    /// Story: A data disk mounted at /data comes back identical after a
    /// trip through v1beta1
    #[test]
    fn story_mounted_disk_offering_round_trips() {
        let original = hub_machine(Some(disk("/data")));
        let spoke = v1beta1::CloudStackMachine::convert_from(&original, None).unwrap();
        assert_eq!(spoke.spec.disk_offering, Some(disk("/data")));

        let back = spoke.convert_to().unwrap();
        assert_eq!(back.spec.disk_offering, Some(disk("/data")));
        assert_eq!(back, original);
    }

    /// Story: The unmounted disk offering dropped at v1beta1 is restored
    #[test]
    fn story_unmounted_disk_offering_restored_from_stash() {
        let original = hub_machine(Some(disk("")));
        let spoke = v1beta1::CloudStackMachine::convert_from(&original, None).unwrap();
        let back = spoke.convert_to().unwrap();
        assert_eq!(back, original);
    }

    /// Story: Removing a mounted data disk at v1beta1 sticks on the way up
    #[test]
    fn story_removed_mounted_disk_is_not_restored() {
        let mut spoke =
            v1beta1::CloudStackMachine::convert_from(&hub_machine(Some(disk("/data"))), None)
                .unwrap();
        spoke.spec.disk_offering = None;

        let back = spoke.convert_to().unwrap();
        assert_eq!(back.spec.disk_offering, None);
        assert_eq!(back.spec.failure_domain_name, "fd1");
    }

    // ==========================================================================
    // Story Tests: Hub-only Fields
    // ==========================================================================

    /// Story: Failure domain, user data switch and detailed status are
    /// carried by the stash
    #[test]
    fn story_hub_only_fields_survive_round_trip() {
        let original = hub_machine(None);
        let spoke = v1beta1::CloudStackMachine::convert_from(&original, None).unwrap();
        let spoke_json = serde_json::to_value(&spoke.spec).unwrap();
        assert!(spoke_json.get("failureDomainName").is_none());

        let back = spoke.convert_to().unwrap();
        assert_eq!(back.spec.failure_domain_name, "fd1");
        assert_eq!(back.spec.uncompressed_user_data, Some(true));
        let status = back.status.as_ref().unwrap();
        assert_eq!(status.status.as_deref(), Some("Ready"));
        assert_eq!(status.reason.as_deref(), Some("Machine is running"));
        assert_eq!(back, original);
    }

    /// Story: A corrupted stash degrades to zero values instead of failing
    #[test]
    fn story_corrupted_stash_degrades_to_defaults() {
        let mut spoke =
            v1beta1::CloudStackMachine::convert_from(&hub_machine(None), None).unwrap();
        spoke
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(CONVERSION_DATA_ANNOTATION.to_string(), "{\"spec\": 42".to_string());

        let back = spoke.convert_to().unwrap();
        assert!(back.spec.failure_domain_name.is_empty());
        assert_eq!(back.spec.uncompressed_user_data, None);
        assert_eq!(back.status.as_ref().unwrap().status, None);
        assert_eq!(back.spec.template.name, "ubuntu-2204-kube-v1.29");
        assert!(back.metadata.annotations.is_none());
    }

    /// Story: A spoke-level edit wins over the stash for shared fields
    #[test]
    fn story_spoke_edit_is_not_overwritten_by_stash() {
        let mut spoke =
            v1beta1::CloudStackMachine::convert_from(&hub_machine(Some(disk("/data"))), None)
                .unwrap();
        spoke.spec.offering.name = "XLarge".to_string();
        if let Some(d) = spoke.spec.disk_offering.as_mut() {
            d.custom_size = 100;
        }

        let back = spoke.convert_to().unwrap();
        assert_eq!(back.spec.offering.name, "XLarge");
        assert_eq!(back.spec.disk_offering.unwrap().custom_size, 100);
    }

    #[test]
    fn spoke_round_trip_keeps_zone_from_prior() {
        let mut spoke =
            v1beta1::CloudStackMachine::convert_from(&hub_machine(Some(disk("/data"))), None)
                .unwrap();
        spoke.spec.zone_id = "z-1".to_string();
        spoke.spec.zone_name = "zone1".to_string();

        let again =
            v1beta1::CloudStackMachine::convert_from(&spoke.convert_to().unwrap(), Some(&spoke))
                .unwrap();
        assert_eq!(again.spec, spoke.spec);
        assert_eq!(again.status, spoke.status);
    }

    #[test]
    fn zone_fields_default_to_empty_without_prior() {
        let spoke = v1beta1::CloudStackMachine::convert_from(&hub_machine(None), None).unwrap();
        assert!(spoke.spec.zone_id.is_empty());
        assert!(spoke.spec.zone_name.is_empty());
    }
}

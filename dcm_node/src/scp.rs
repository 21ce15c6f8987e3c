//! The Store SCP: accepts associations, validates the calling AE title on
//! C-ECHO and hands every received object to the receive buffer. One
//! acceptor thread, one handler thread per association; a broken listener
//! is rebuilt after a bounded back-off.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dicom_core::dicom_value;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::PDataValueType;
use dicom_ul::Pdu;
use tracing::{debug, error, info, warn};

use crate::buffer::{IncomingObject, ReceiveBuffer};
use crate::codec;
use crate::sanitize;
use crate::transfer::{SCP_ABSTRACT_SYNTAXES, TRANSFER_SYNTAXES};

/// Everything the listener needs, extracted from the node configuration.
#[derive(Debug, Clone)]
pub struct ScpConfig {
    pub ae_title: String,
    pub listen_ip: String,
    pub port: u16,
    pub trusted_ae_titles: Vec<String>,
    pub restart_backoff: Duration,
}

impl ScpConfig {
    fn is_trusted(&self, calling_ae: &str) -> bool {
        self.trusted_ae_titles.iter().any(|ae| ae == calling_ae)
    }
}

/// Runs the accept loop until `stop` flips. Never returns early on
/// listener errors: those are logged and the listener is rebuilt after
/// the configured back-off.
pub fn run_listener(config: ScpConfig, buffer: Arc<ReceiveBuffer>, stop: Arc<AtomicBool>) {
    let addr = format!("{}:{}", config.listen_ip, config.port);
    while !stop.load(Ordering::SeqCst) {
        let listener = match TcpListener::bind(&addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Unable to bind DICOM receiver on {addr}: {e}");
                backoff(&stop, config.restart_backoff);
                continue;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!("Unable to configure listener: {e}");
            backoff(&stop, config.restart_backoff);
            continue;
        }
        info!(
            "DICOM receiver listening on {addr} with AE title {:?}",
            config.ae_title
        );

        loop {
            if stop.load(Ordering::SeqCst) {
                info!("DICOM receiver stopped");
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Incoming connection from {peer}");
                    let config = config.clone();
                    let buffer = Arc::clone(&buffer);
                    let _ = std::thread::Builder::new()
                        .name("scp-association".into())
                        .spawn(move || {
                            if let Err(message) = handle_association(stream, &config, &buffer) {
                                // association errors end the handler, not
                                // the listener
                                warn!("Association with {peer} ended with error: {message}");
                            }
                        });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!("DICOM receiver accept failed: {e}; restarting listener");
                    break;
                }
            }
        }
        backoff(&stop, config.restart_backoff);
    }
}

fn backoff(stop: &AtomicBool, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn handle_association(
    stream: TcpStream,
    config: &ScpConfig,
    buffer: &ReceiveBuffer,
) -> Result<(), String> {
    stream
        .set_nonblocking(false)
        .map_err(|e| format!("unable to configure stream: {e}"))?;

    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(&config.ae_title);
    for ts in TRANSFER_SYNTAXES {
        options = options.with_transfer_syntax(*ts);
    }
    for uid in SCP_ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = options
        .establish(stream)
        .map_err(|e| format!("could not establish association: {e}"))?;
    let calling_ae = association.client_ae_title().to_string();
    info!("New association from {calling_ae}");

    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid: u16 = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();
    let command_ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

    loop {
        match association.receive() {
            Ok(mut pdu) => match pdu {
                Pdu::PData { ref mut data } => {
                    for data_value in data {
                        if data_value.value_type == PDataValueType::Data && !data_value.is_last {
                            instance_buffer.append(&mut data_value.data);
                        } else if data_value.value_type == PDataValueType::Command
                            && data_value.is_last
                        {
                            let obj = InMemDicomObject::read_dataset_with_ts(
                                data_value.data.as_slice(),
                                &command_ts,
                            )
                            .map_err(|e| format!("failed to read incoming command: {e}"))?;
                            let command_field = obj
                                .element(tags::COMMAND_FIELD)
                                .map_err(|e| e.to_string())?
                                .uint16()
                                .map_err(|e| e.to_string())?;
                            msgid = obj
                                .element(tags::MESSAGE_ID)
                                .ok()
                                .and_then(|e| e.to_int().ok())
                                .unwrap_or(msgid);

                            if command_field == 0x0030 {
                                // C-ECHO: only trusted peers get a success
                                let status = if config.is_trusted(&calling_ae) {
                                    info!("Verification request from trusted AE {calling_ae:?}");
                                    0x0000
                                } else {
                                    warn!(
                                        "Verification request from untrusted AE {calling_ae:?} \
                                         rejected"
                                    );
                                    0xC001
                                };
                                let rsp = create_cecho_response(msgid, status);
                                let mut rsp_data = Vec::new();
                                rsp.write_dataset_with_ts(&mut rsp_data, &command_ts)
                                    .map_err(|e| e.to_string())?;
                                association
                                    .send(&Pdu::PData {
                                        data: vec![dicom_ul::pdu::PDataValue {
                                            presentation_context_id: data_value
                                                .presentation_context_id,
                                            value_type: PDataValueType::Command,
                                            is_last: true,
                                            data: rsp_data,
                                        }],
                                    })
                                    .map_err(|e| e.to_string())?;
                            } else {
                                sop_class_uid = codec::string_value(&obj, tags::AFFECTED_SOP_CLASS_UID);
                                sop_instance_uid =
                                    codec::string_value(&obj, tags::AFFECTED_SOP_INSTANCE_UID);
                            }
                            instance_buffer.clear();
                        } else if data_value.value_type == PDataValueType::Data
                            && data_value.is_last
                        {
                            instance_buffer.append(&mut data_value.data);
                            let raw_dataset = std::mem::take(&mut instance_buffer);

                            let transfer_syntax = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == data_value.presentation_context_id)
                                .map(|pc| pc.transfer_syntax.trim().to_string())
                                .ok_or("missing presentation context")?;

                            let status = match stage_object(
                                buffer,
                                &calling_ae,
                                &transfer_syntax,
                                &sop_class_uid,
                                &sop_instance_uid,
                                raw_dataset,
                            ) {
                                Ok(()) => 0x0000,
                                Err(message) => {
                                    error!(
                                        "Unable to buffer object {sop_instance_uid}: {message}"
                                    );
                                    0xC001
                                }
                            };

                            let rsp = create_cstore_response(
                                msgid,
                                &sop_class_uid,
                                &sop_instance_uid,
                                status,
                            );
                            let mut rsp_data = Vec::new();
                            rsp.write_dataset_with_ts(&mut rsp_data, &command_ts)
                                .map_err(|e| e.to_string())?;
                            association
                                .send(&Pdu::PData {
                                    data: vec![dicom_ul::pdu::PDataValue {
                                        presentation_context_id: data_value.presentation_context_id,
                                        value_type: PDataValueType::Command,
                                        is_last: true,
                                        data: rsp_data,
                                    }],
                                })
                                .map_err(|e| e.to_string())?;
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    if let Err(e) = association.send(&Pdu::ReleaseRP) {
                        warn!("Failed to acknowledge association release: {e}");
                    }
                    info!("Released association with {calling_ae}");
                    break;
                }
                Pdu::AbortRQ { source } => {
                    warn!("Association aborted by peer: {source:?}");
                    break;
                }
                _ => {}
            },
            Err(e) => {
                debug!("Association receive ended: {e}");
                break;
            }
        }
    }
    Ok(())
}

/// Parses the received dataset, applies the tag sanitizers and stages it
/// in the receive buffer. Doses keep their wire bytes for verbatim
/// persistence.
fn stage_object(
    buffer: &ReceiveBuffer,
    calling_ae: &str,
    transfer_syntax: &str,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    raw_dataset: Vec<u8>,
) -> Result<(), String> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| format!("unknown transfer syntax {transfer_syntax}"))?;
    let mut dataset = InMemDicomObject::read_dataset_with_ts(raw_dataset.as_slice(), ts)
        .map_err(|e| format!("failed to read dataset: {e}"))?;
    sanitize::apply_tag_sanitizers(&mut dataset);

    let modality = codec::string_value(&dataset, tags::MODALITY).to_uppercase();
    let raw = (modality == "RTDOSE").then_some(raw_dataset);

    buffer
        .ingest(IncomingObject {
            dataset,
            transfer_syntax: transfer_syntax.to_string(),
            calling_ae: calling_ae.to_string(),
            sop_class_uid: sop_class_uid.to_string(),
            sop_instance_uid: sop_instance_uid.to_string(),
            raw_dataset: raw,
        })
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn create_cecho_response(message_id: u16, status: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scp_config(trusted: &[&str]) -> ScpConfig {
        ScpConfig {
            ae_title: "DICOM-RT-KAFFEE".to_string(),
            listen_ip: "127.0.0.1".to_string(),
            port: 11112,
            trusted_ae_titles: trusted.iter().map(|s| s.to_string()).collect(),
            restart_backoff: Duration::from_secs(10),
        }
    }

    #[test]
    fn trusted_ae_check_is_exact() {
        let config = scp_config(&["TR_SEND", "MRMULTI"]);
        assert!(config.is_trusted("TR_SEND"));
        assert!(!config.is_trusted("TR_SEND2"));
        assert!(!config.is_trusted("UNKNOWN_AE"));
    }

    #[test]
    fn echo_response_carries_the_rejection_status() {
        let rsp = create_cecho_response(7, 0xC001);
        let status: u16 = rsp.element(tags::STATUS).unwrap().to_int().unwrap();
        assert_eq!(status, 0xC001);
        let answered: u16 = rsp
            .element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
            .unwrap()
            .to_int()
            .unwrap();
        assert_eq!(answered, 7);
    }

    #[test]
    fn store_response_echoes_the_affected_uids() {
        let rsp = create_cstore_response(3, "1.2.840.10008.5.1.4.1.1.481.5", "1.2.3.PLAN.A", 0);
        assert_eq!(
            codec::string_value(&rsp, tags::AFFECTED_SOP_INSTANCE_UID),
            "1.2.3.PLAN.A"
        );
        let status: u16 = rsp.element(tags::STATUS).unwrap().to_int().unwrap();
        assert_eq!(status, 0);
    }
}

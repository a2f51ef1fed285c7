/// Key layout for the job ledger partitions
///
/// - `jobs`: job:{job_id} -> ExportJob (JSON)
/// - `status_index`: status:{STATUS}:{job_id} -> job_id
///
/// The status index keeps `find_by_status` a prefix scan instead of a full
/// table walk; it is rewritten on every status change.
use crate::job::JobStatus;

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{}", job_id).into_bytes()
}

pub fn encode_status_key(status: JobStatus, job_id: &str) -> Vec<u8> {
    format!("status:{}:{}", status, job_id).into_bytes()
}

pub fn encode_status_prefix(status: JobStatus) -> Vec<u8> {
    format!("status:{}:", status).into_bytes()
}

pub fn decode_status_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    let rest = key_str.strip_prefix("status:")?;
    rest.split_once(':').map(|(_, job_id)| job_id.to_string())
}

//! Client request dispatch: command acks, paginated record/tag/data
//! streams, calibration table access and system control.
//!
//! Stream handlers take read-side store handles only and run concurrently
//! with the sample loop; every failure is converted to a FAIL response plus
//! a status-text line, never a crash.

use std::time::Duration;

use probe_proto::{
    AckOp, ClientRequest, CommandResult, DataPageFrame, GatewayLink, LinkFrame, RecordId,
    RequestError, ResponseResult, StreamKind, TagEntry, TagId, PAGE_DATA_SIZE,
};
use tracing::warn;

use crate::system;
use crate::ModeSwitcher;

impl ModeSwitcher {
    /// Handle one request from the remote client. Mission start/stop is
    /// routed by the caller to the mission executor; everything else lands
    /// here.
    pub async fn handle_request(&self, req: ClientRequest) {
        match req {
            ClientRequest::SetMode {
                mode,
                frequency_hz,
                record_rate_hz,
                thinning_ratio,
                ref_power,
            } => {
                let result = self
                    .set_mode(mode, frequency_hz, record_rate_hz, thinning_ratio, ref_power)
                    .await;
                self.ack(AckOp::SetMode, result, None).await;
            }
            ClientRequest::StartRecord { name } => {
                let result = self.start_record(&name).await;
                self.ack(AckOp::StartRecord, result, None).await;
            }
            ClientRequest::StopRecord => {
                let result = self.stop_record().await;
                self.ack(AckOp::StopRecord, result, None).await;
            }
            ClientRequest::SetRecordTag { kind, name, value } => {
                let result = self.set_record_tag(kind, &name, value).await;
                self.ack(AckOp::SetRecordTag, result, None).await;
            }
            ClientRequest::StartCalibration => {
                self.inner.calibration.start_calibration();
                self.status();
                self.ack(AckOp::StartCalibration, CommandResult::Accepted, None)
                    .await;
            }
            ClientRequest::StopCalibration => {
                self.inner.calibration.stop_calibration();
                self.status();
                self.ack(AckOp::StopCalibration, CommandResult::Accepted, None)
                    .await;
            }
            ClientRequest::ReadCalibrationTableInfo { index } => {
                match self.inner.calibration.table_info(index) {
                    Ok(info) => self.send(LinkFrame::CalibrationTableItem(info)).await,
                    Err(e) => self.status_text(format!("calibration table {index}: {e}")).await,
                }
            }
            ClientRequest::ReadCalibrationTableRow { index, row } => {
                match self.inner.calibration.table_row(index, row) {
                    Ok(value) => {
                        self.send(LinkFrame::CalibrationRowItem {
                            table: index,
                            row,
                            value,
                        })
                        .await
                    }
                    Err(e) => {
                        self.status_text(format!("calibration table {index} row {row}: {e}"))
                            .await
                    }
                }
            }
            ClientRequest::WriteCalibrationTable { index, rows } => {
                let updated = self.inner.telemetry.now_unix_us();
                let (result, text) =
                    match self.inner.calibration.write_table(index, rows, updated) {
                        Ok(()) => (CommandResult::Accepted, None),
                        Err(e) => (CommandResult::Failed, Some(e.to_string())),
                    };
                self.ack(AckOp::WriteCalibrationTable, result, text).await;
            }
            ClientRequest::SystemControl { action } => {
                let result = system::execute(action);
                self.ack(AckOp::SystemControl, result, None).await;
            }
            ClientRequest::ListRecords { skip, count } => {
                let res = self.list_records(skip, count).await;
                self.finish_stream(StreamKind::Records, res).await;
            }
            ClientRequest::ListTags {
                record,
                skip,
                count,
            } => {
                let res = self.list_tags(record, skip, count).await;
                self.finish_stream(StreamKind::Tags, res).await;
            }
            ClientRequest::ListData {
                record,
                skip,
                count,
            } => {
                let res = self.list_data(record, skip, count).await;
                self.finish_stream(StreamKind::Data, res).await;
            }
            ClientRequest::DeleteRecord { record } => {
                let res = self.delete_record(record);
                self.finish_stream(StreamKind::DeleteRecord, res).await;
            }
            ClientRequest::DeleteTag { record, tag } => {
                let res = self.delete_tag(record, tag);
                self.finish_stream(StreamKind::DeleteTag, res).await;
            }
            ClientRequest::StartMission { .. } | ClientRequest::StopMission => {
                warn!("mission request reached the switcher; dropped");
            }
        }
    }

    async fn list_records(&self, skip: u16, count: u16) -> Result<(), RequestError> {
        let inner = &self.inner;
        let ids: Vec<RecordId> = inner
            .store
            .records()
            .into_iter()
            .skip(skip as usize)
            .take(count as usize)
            .collect();
        self.success(StreamKind::Records, ids.len() as u32).await?;
        for id in ids {
            let entry = inner.store.entry(id)?;
            self.send_item(LinkFrame::RecordItem(entry)).await?;
        }
        Ok(())
    }

    async fn list_tags(&self, record: RecordId, skip: u16, count: u16) -> Result<(), RequestError> {
        let reader = self.inner.store.open_reader(record)?;
        let ids = reader.tag_ids(skip, count);
        self.success(StreamKind::Tags, ids.len() as u32).await?;
        for id in ids {
            let tag = reader.read_tag(id)?;
            self.send_item(LinkFrame::TagItem(TagEntry {
                record,
                id: tag.id,
                kind: tag.kind,
                name: tag.name.clone(),
                value: tag.value,
            }))
            .await?;
        }
        Ok(())
    }

    async fn list_data(&self, record: RecordId, skip: u32, count: u32) -> Result<(), RequestError> {
        let reader = self.inner.store.open_reader(record)?;
        let n = reader.item_count(skip, count);
        self.success(StreamKind::Data, n).await?;
        let mut payload = [0u8; PAGE_DATA_SIZE];
        for index in skip..skip + n {
            reader.read_page(index, &mut payload)?;
            self.send_item(LinkFrame::DataItem(DataPageFrame {
                record,
                page_index: index,
                payload,
            }))
            .await?;
        }
        Ok(())
    }

    fn delete_record(&self, record: RecordId) -> Result<(), RequestError> {
        self.inner.store.delete(record)?;
        self.status();
        Ok(())
    }

    fn delete_tag(&self, record: RecordId, tag: TagId) -> Result<(), RequestError> {
        self.inner.store.delete_tag(record, tag)?;
        Ok(())
    }

    /// SUCCESS response carrying the number of items about to follow.
    async fn success(&self, stream: StreamKind, count: u32) -> Result<(), RequestError> {
        self.inner
            .gateway
            .send(LinkFrame::Response {
                stream,
                result: ResponseResult::Success { count },
            })
            .await
            .map_err(|e| RequestError::Failed(format!("gateway send: {e:#}")))
    }

    /// One stream item followed by the inter-item pacing delay.
    async fn send_item(&self, frame: LinkFrame) -> Result<(), RequestError> {
        self.inner
            .gateway
            .send(frame)
            .await
            .map_err(|e| RequestError::Failed(format!("gateway send: {e:#}")))?;
        tokio::time::sleep(Duration::from_millis(self.inner.cfg.record_send_delay_ms)).await;
        Ok(())
    }

    /// Stream epilogue: deletes get a SUCCESS, failures a FAIL response
    /// plus a status-text line with the error.
    async fn finish_stream(&self, stream: StreamKind, res: Result<(), RequestError>) {
        match res {
            Ok(())
                if matches!(stream, StreamKind::DeleteRecord | StreamKind::DeleteTag) =>
            {
                let _ = self.success(stream, 0).await;
            }
            Ok(()) => {}
            Err(e) => {
                warn!("{stream:?} request failed: {e}");
                let _ = self
                    .inner
                    .gateway
                    .send(LinkFrame::Response {
                        stream,
                        result: ResponseResult::Fail {
                            error: e.to_string(),
                        },
                    })
                    .await;
                self.status_text(format!("{stream:?} request failed: {e}")).await;
            }
        }
    }

    async fn ack(&self, op: AckOp, result: CommandResult, text: Option<String>) {
        let _ = self
            .inner
            .gateway
            .send(LinkFrame::Ack { op, result, text })
            .await;
    }

    async fn status_text(&self, text: String) {
        let _ = self.inner.gateway.send(LinkFrame::StatusText { text }).await;
    }

    async fn send(&self, frame: LinkFrame) {
        let _ = self.inner.gateway.send(frame).await;
    }
}

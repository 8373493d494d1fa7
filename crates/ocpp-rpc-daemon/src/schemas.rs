//! Structural checks for the OCPP 2.0.1 messages the daemons exchange.

use ocpp_rpc::{Direction, JsonType, SchemaSet, Shape};

pub fn ocpp201() -> SchemaSet {
    SchemaSet::new("ocpp2.0.1")
        .with(
            "BootNotification",
            Direction::Request,
            Shape::object()
                .required("reason", JsonType::String)
                .required("chargingStation", JsonType::Object)
                .optional("customData", JsonType::Object)
                .closed(),
        )
        .with(
            "BootNotification",
            Direction::Response,
            Shape::object()
                .required("currentTime", JsonType::String)
                .required("interval", JsonType::Integer)
                .required("status", JsonType::String)
                .optional("statusInfo", JsonType::Object)
                .optional("customData", JsonType::Object)
                .closed(),
        )
        .with(
            "Heartbeat",
            Direction::Request,
            Shape::object().optional("customData", JsonType::Object).closed(),
        )
        .with(
            "Heartbeat",
            Direction::Response,
            Shape::object()
                .required("currentTime", JsonType::String)
                .optional("customData", JsonType::Object)
                .closed(),
        )
        .with(
            "StatusNotification",
            Direction::Request,
            Shape::object()
                .required("timestamp", JsonType::String)
                .required("connectorStatus", JsonType::String)
                .required("evseId", JsonType::Integer)
                .required("connectorId", JsonType::Integer)
                .optional("customData", JsonType::Object)
                .closed(),
        )
        .with(
            "StatusNotification",
            Direction::Response,
            Shape::object().optional("customData", JsonType::Object).closed(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_rpc::ErrorCode;
    use serde_json::json;

    #[test]
    fn boot_request_from_the_field() {
        let schemas = ocpp201();
        let params = json!({
            "reason": "PowerUp",
            "chargingStation": {"model": "L2", "vendorName": "Vega"}
        });
        assert!(schemas.validate_request("BootNotification", &params).is_ok());

        let violation = schemas
            .validate_request("BootNotification", &json!({"reason": 7, "chargingStation": {}}))
            .unwrap_err();
        assert_eq!(violation.code(), ErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn unknown_actions_have_no_schema() {
        let violation = ocpp201().validate_request("Authorize", &json!({})).unwrap_err();
        assert_eq!(violation.code(), ErrorCode::ProtocolError);
    }
}

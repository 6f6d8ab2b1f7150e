//! Identifier types used across the services.

use crate::typed_id;

typed_id!(
    /// A cluster: one teacher's partitioning problem over a roster.
    ClusterId,
    "clu"
);

typed_id!(
    /// A user account resolvable from an email address.
    UserId,
    "usr"
);

typed_id!(
    /// One invocation of the external solver.
    JobId,
    "job"
);

typed_id!(
    /// Correlation id attached to every HTTP request.
    RequestId,
    "req"
);

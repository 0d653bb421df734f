#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LockStatusRequest {
    #[prost(string, tag="1")]
    pub lock_key: ::prost::alloc::string::String,
    #[prost(string, tag="2")]
    pub instance_id: ::prost::alloc::string::String,
    #[prost(bool, tag="3")]
    pub is_busy: bool,
    /// Empty means no lock data.
    #[prost(string, tag="4")]
    pub lock_data: ::prost::alloc::string::String,
    /// Lease end in Unix epoch milliseconds. 0 means the status never expires.
    #[prost(int64, tag="5")]
    pub valid_until_millis: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstanceLockStatus {
    #[prost(bool, tag="1")]
    pub is_busy: bool,
    #[prost(string, tag="2")]
    pub lock_data: ::prost::alloc::string::String,
    #[prost(int64, tag="3")]
    pub valid_until_millis: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LockStatusNotification {
    #[prost(string, tag="1")]
    pub lock_key: ::prost::alloc::string::String,
    #[prost(map="string, message", tag="2")]
    pub instances_status: ::std::collections::HashMap<::prost::alloc::string::String, InstanceLockStatus>,
}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStatusReply {
}
# [doc = r" Generated client implementations."] pub mod reactive_lock_grpc_client { # ! [allow (unused_variables , dead_code , missing_docs)] use tonic :: codegen :: * ; # [doc = " Hub that every instance sharing a lock key connects to. Instances push their own busy/idle"] # [doc = " status and receive the full status table of the lock key whenever it changes."] pub struct ReactiveLockGrpcClient < T > { inner : tonic :: client :: Grpc < T > , } impl ReactiveLockGrpcClient < tonic :: transport :: Channel > { # [doc = r" Attempt to create a new client by connecting to a given endpoint."] pub async fn connect < D > (dst : D) -> Result < Self , tonic :: transport :: Error > where D : std :: convert :: TryInto < tonic :: transport :: Endpoint > , D :: Error : Into < StdError > , { let conn = tonic :: transport :: Endpoint :: new (dst) ? . connect () . await ? ; Ok (Self :: new (conn)) } } impl < T > ReactiveLockGrpcClient < T > where T : tonic :: client :: GrpcService < tonic :: body :: BoxBody > , T :: ResponseBody : Body + HttpBody + Send + 'static , T :: Error : Into < StdError > , < T :: ResponseBody as HttpBody > :: Error : Into < StdError > + Send , { pub fn new (inner : T) -> Self { let inner = tonic :: client :: Grpc :: new (inner) ; Self { inner } } pub fn with_interceptor (inner : T , interceptor : impl Into < tonic :: Interceptor >) -> Self { let inner = tonic :: client :: Grpc :: with_interceptor (inner , interceptor) ; Self { inner } } # [doc = " Every request on the inbound stream upserts the sender's status. The first request also"] # [doc = " selects the lock key whose snapshots are pushed back on the outbound stream."] pub async fn subscribe_lock_status (& mut self , request : impl tonic :: IntoStreamingRequest < Message = super :: LockStatusRequest >) -> Result < tonic :: Response < tonic :: codec :: Streaming < super :: LockStatusNotification >> , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/reactivelock.ReactiveLockGrpc/SubscribeLockStatus") ; self . inner . streaming (request . into_streaming_request () , path , codec) . await } pub async fn set_status (& mut self , request : impl tonic :: IntoRequest < super :: LockStatusRequest > ,) -> Result < tonic :: Response < super :: SetStatusReply > , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/reactivelock.ReactiveLockGrpc/SetStatus") ; self . inner . unary (request . into_request () , path , codec) . await } } impl < T : Clone > Clone for ReactiveLockGrpcClient < T > { fn clone (& self) -> Self { Self { inner : self . inner . clone () , } } } impl < T > std :: fmt :: Debug for ReactiveLockGrpcClient < T > { fn fmt (& self , f : & mut std :: fmt :: Formatter < '_ >) -> std :: fmt :: Result { write ! (f , "ReactiveLockGrpcClient {{ ... }}") } } }# [doc = r" Generated server implementations."] pub mod reactive_lock_grpc_server { # ! [allow (unused_variables , dead_code , missing_docs)] use tonic :: codegen :: * ; # [doc = "Generated trait containing gRPC methods that should be implemented for use with ReactiveLockGrpcServer."] # [async_trait] pub trait ReactiveLockGrpc : Send + Sync + 'static { # [doc = "Server streaming response type for the SubscribeLockStatus method."] type SubscribeLockStatusStream : futures_core :: Stream < Item = Result < super :: LockStatusNotification , tonic :: Status >> + Send + Sync + 'static ; # [doc = " Every request on the inbound stream upserts the sender's status. The first request also"] # [doc = " selects the lock key whose snapshots are pushed back on the outbound stream."] async fn subscribe_lock_status (& self , request : tonic :: Request < tonic :: Streaming < super :: LockStatusRequest >>) -> Result < tonic :: Response < Self :: SubscribeLockStatusStream > , tonic :: Status > ; async fn set_status (& self , request : tonic :: Request < super :: LockStatusRequest >) -> Result < tonic :: Response < super :: SetStatusReply > , tonic :: Status > ; } # [doc = " Hub that every instance sharing a lock key connects to. Instances push their own busy/idle"] # [doc = " status and receive the full status table of the lock key whenever it changes."] # [derive (Debug)] pub struct ReactiveLockGrpcServer < T : ReactiveLockGrpc > { inner : _Inner < T > , } struct _Inner < T > (Arc < T > , Option < tonic :: Interceptor >) ; impl < T : ReactiveLockGrpc > ReactiveLockGrpcServer < T > { pub fn new (inner : T) -> Self { let inner = Arc :: new (inner) ; let inner = _Inner (inner , None) ; Self { inner } } pub fn with_interceptor (inner : T , interceptor : impl Into < tonic :: Interceptor >) -> Self { let inner = Arc :: new (inner) ; let inner = _Inner (inner , Some (interceptor . into ())) ; Self { inner } } } impl < T , B > Service < http :: Request < B >> for ReactiveLockGrpcServer < T > where T : ReactiveLockGrpc , B : HttpBody + Send + Sync + 'static , B :: Error : Into < StdError > + Send + 'static , { type Response = http :: Response < tonic :: body :: BoxBody > ; type Error = Never ; type Future = BoxFuture < Self :: Response , Self :: Error > ; fn poll_ready (& mut self , _cx : & mut Context < '_ >) -> Poll < Result < () , Self :: Error >> { Poll :: Ready (Ok (())) } fn call (& mut self , req : http :: Request < B >) -> Self :: Future { let inner = self . inner . clone () ; match req . uri () . path () { "/reactivelock.ReactiveLockGrpc/SubscribeLockStatus" => { # [allow (non_camel_case_types)] struct SubscribeLockStatusSvc < T : ReactiveLockGrpc > (pub Arc < T >) ; impl < T : ReactiveLockGrpc > tonic :: server :: StreamingService < super :: LockStatusRequest > for SubscribeLockStatusSvc < T > { type Response = super :: LockStatusNotification ; type ResponseStream = T :: SubscribeLockStatusStream ; type Future = BoxFuture < tonic :: Response < Self :: ResponseStream > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < tonic :: Streaming < super :: LockStatusRequest >>) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . subscribe_lock_status (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 ; let inner = inner . 0 ; let method = SubscribeLockStatusSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . streaming (method , req) . await ; Ok (res) } ; Box :: pin (fut) } "/reactivelock.ReactiveLockGrpc/SetStatus" => { # [allow (non_camel_case_types)] struct SetStatusSvc < T : ReactiveLockGrpc > (pub Arc < T >) ; impl < T : ReactiveLockGrpc > tonic :: server :: UnaryService < super :: LockStatusRequest > for SetStatusSvc < T > { type Response = super :: SetStatusReply ; type Future = BoxFuture < tonic :: Response < Self :: Response > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < super :: LockStatusRequest >) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . set_status (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 . clone () ; let inner = inner . 0 ; let method = SetStatusSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . unary (method , req) . await ; Ok (res) } ; Box :: pin (fut) } _ => Box :: pin (async move { Ok (http :: Response :: builder () . status (200) . header ("grpc-status" , "12") . header ("content-type" , "application/grpc") . body (tonic :: body :: BoxBody :: empty ()) . unwrap ()) }) , } } } impl < T : ReactiveLockGrpc > Clone for ReactiveLockGrpcServer < T > { fn clone (& self) -> Self { let inner = self . inner . clone () ; Self { inner } } } impl < T : ReactiveLockGrpc > Clone for _Inner < T > { fn clone (& self) -> Self { Self (self . 0 . clone () , self . 1 . clone ()) } } impl < T : std :: fmt :: Debug > std :: fmt :: Debug for _Inner < T > { fn fmt (& self , f : & mut std :: fmt :: Formatter < '_ >) -> std :: fmt :: Result { write ! (f , "{:?}" , self . 0) } } impl < T : ReactiveLockGrpc > tonic :: transport :: NamedService for ReactiveLockGrpcServer < T > { const NAME : & 'static str = "reactivelock.ReactiveLockGrpc" ; } }